use std::process::ExitCode;

// setns only switches the calling thread, so everything runs on one
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    netter::init_log();

    netter::run().await
}
