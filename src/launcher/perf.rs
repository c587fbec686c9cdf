use std::net::TcpListener;

/// Deferred launch under `perf record`.
///
/// The listener stays bound until a profiling client connects; the accepted
/// socket then becomes the stdout forwarding destination and `argv` is what
/// actually gets started.
#[derive(Debug)]
pub struct PerfHandoff {
    pub listener: TcpListener,
    pub argv: Vec<String>,
}

/// Splits the `--profile-perf` parameter list on commas. A doubled comma
/// escapes a literal one.
pub fn extract_perf_params(s: &str) -> Vec<String> {
    let mut out = vec![];
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            if chars.peek() == Some(&',') {
                chars.next();
                current.push(',');
            } else {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    out.push(current);
    out
}

/// Builds the `perf record` argument vector wrapping the application
/// command. `-o -` streams the capture to stdout, which the supervisor
/// forwards to the profiling client.
pub fn perf_record_argv(params: &[String], command: &[String]) -> Vec<String> {
    let mut argv = vec!["perf".to_string(), "record".to_string()];
    argv.extend(params.iter().cloned());
    argv.push("-o".to_string());
    argv.push("-".to_string());
    argv.push("--".to_string());
    argv.push(command.join(" "));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_single_commas() {
        assert_eq!(extract_perf_params("-e,cycles,-c,1000"),
                   vec!["-e", "cycles", "-c", "1000"]);
    }

    #[test]
    fn doubled_comma_escapes() {
        assert_eq!(extract_perf_params("a,,b"), vec!["a,b"]);
        assert_eq!(extract_perf_params("a,,b,c"), vec!["a,b", "c"]);
    }

    #[test]
    fn single_param_passes_through() {
        assert_eq!(extract_perf_params("--call-graph"), vec!["--call-graph"]);
    }

    #[test]
    fn trailing_comma_yields_empty_param() {
        assert_eq!(extract_perf_params("a,"), vec!["a", ""]);
    }

    #[test]
    fn record_argv_wraps_the_command() {
        let argv = perf_record_argv(
            &["-e".to_string(), "cycles".to_string()],
            &["/usr/bin/app".to_string(), "--fullscreen".to_string()],
        );
        assert_eq!(
            argv,
            vec!["perf", "record", "-e", "cycles", "-o", "-", "--",
                 "/usr/bin/app --fullscreen"]
        );
    }
}
