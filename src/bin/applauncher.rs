use std::process::ExitCode;

fn main() -> ExitCode {
    match applauncher::launcher::main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("applauncher: {e:#}");
            ExitCode::FAILURE
        }
    }
}
