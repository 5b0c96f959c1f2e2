use std::process::ExitCode;

fn main() -> ExitCode {
    ovrseen_device_lib::run()
}
