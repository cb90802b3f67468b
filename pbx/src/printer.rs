use std::sync::atomic::{AtomicUsize, Ordering};

use console::{style, Term};

use pbx_build::{
    BuildObserver, BuildReport, BuildStatus, InvocationExecutionError, InvocationGraph,
    InvocationId, NodeError, Reason,
};
use pbx_interface::LaunchOutput;
use pbx_invocation::Invocation;

/// Prints `[n/total] description` as invocations finish.
pub struct ConsolePrinter {
    total: usize,
    done: AtomicUsize,
    explain: bool,
    verbose: bool,
}

impl ConsolePrinter {
    pub fn new(total: usize, explain: bool, verbose: bool) -> Self {
        ConsolePrinter {
            total,
            done: AtomicUsize::new(0),
            explain,
            verbose,
        }
    }

    fn status_line(&self, invocation: &Invocation) -> String {
        let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let label = if self.verbose {
            invocation.command_line()
        } else {
            invocation.description()
        };
        format!("[{}/{}] {}", n, self.total, label)
    }

    fn environment_lines(&self, invocation: &Invocation) -> Vec<String> {
        if !(self.verbose && invocation.show_environment_in_log()) {
            return vec![];
        }
        let mut lines: Vec<String> = invocation
            .environment()
            .iter()
            .map(|(k, v)| format!("    export {}={}", k, v))
            .collect();
        lines.sort();
        lines
    }

    pub fn summarize(&self, graph: &InvocationGraph, report: &BuildReport) {
        let term = Term::stdout();
        let (ran, _) = report.counts();
        let line = match report.status {
            BuildStatus::Succeeded if ran == 0 => "pbx: no work to do.".to_owned(),
            BuildStatus::Succeeded => return,
            BuildStatus::Failed { first } => format!(
                "pbx: build stopped: {} failed.",
                graph[first].description()
            ),
            BuildStatus::Cancelled => "pbx: build interrupted.".to_owned(),
        };
        let _ = term.write_line(&line);
    }
}

fn write_output(term: &Term, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(bytes);
    let _ = term.write_str(&text);
    if !text.ends_with('\n') {
        let _ = term.write_line("");
    }
}

impl BuildObserver for ConsolePrinter {
    fn started(&self, _id: InvocationId, invocation: &Invocation, reason: &Reason) {
        if self.explain {
            let _ = Term::stderr().write_line(&format!(
                "pbx explain: {} runs because {}",
                invocation.description(),
                reason
            ));
        }
    }

    fn skipped(&self, _id: InvocationId, _invocation: &Invocation) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(
        &self,
        _id: InvocationId,
        invocation: &Invocation,
        result: Result<Option<&LaunchOutput>, &NodeError>,
    ) {
        let term = Term::stdout();
        let _ = term.write_line(&self.status_line(invocation));
        for line in self.environment_lines(invocation) {
            let _ = term.write_line(&line);
        }
        match result {
            Ok(None) => {}
            Ok(Some(output)) => {
                write_output(&term, &output.stdout);
                write_output(&term, &output.stderr);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                let _ = term.write_line(&format!(
                    "{} {}",
                    style("FAILED:").red().bold(),
                    invocation.description()
                ));
                let _ = term.write_line(&invocation.command_line());
                let _ = term.write_line(&e.to_string());
                if let NodeError::Execution(InvocationExecutionError::ExitStatus { stderr, .. }) = e
                {
                    write_output(&term, stderr);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pbx_invocation::Executable;

    #[test]
    fn test_status_line_counts_skipped() {
        let printer = ConsolePrinter::new(3, false, false);
        let compile = Invocation::new()
            .with_executable(Executable::determine("cc"))
            .with_arguments(vec!["-c", "a.c"])
            .with_outputs(vec!["a.o"]);
        printer.skipped(InvocationId::new(0), &compile);
        insta::assert_snapshot!(printer.status_line(&compile), @"[2/3] a.o");

        let verbose = ConsolePrinter::new(1, false, true);
        insta::assert_snapshot!(verbose.status_line(&compile), @"[1/1] cc -c a.c");
    }

    #[test]
    fn test_environment_only_when_asked() {
        let invocation = Invocation::new()
            .with_environment(vec![("LANG", "C"), ("CC", "clang")])
            .with_show_environment_in_log(true);
        assert!(ConsolePrinter::new(1, false, false)
            .environment_lines(&invocation)
            .is_empty());
        assert_eq!(
            ConsolePrinter::new(1, false, true).environment_lines(&invocation),
            vec!["    export CC=clang", "    export LANG=C"]
        );
    }
}
