use std::sync::Mutex;

use pbx_build::{BuildObserver, InvocationId, NodeError, Reason};
use pbx_interface::{
    testing::MemoryFilesystem, CancellationToken, Filesystem, LaunchError, LaunchOutput,
    LaunchRequest, Launcher,
};
use pbx_invocation::{Executable, Invocation};

/// Pretends to be a compiler: `cc -o OUT IN...` concatenates its inputs into OUT, `false` fails.
pub struct FakeTools<'a> {
    fs: &'a MemoryFilesystem,
    pub ran: Mutex<Vec<String>>,
}

impl<'a> FakeTools<'a> {
    pub fn new(fs: &'a MemoryFilesystem) -> Self {
        FakeTools {
            fs,
            ran: Mutex::new(vec![]),
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.ran.lock().unwrap().clear();
    }
}

impl<'a> Launcher for FakeTools<'a> {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<LaunchOutput, LaunchError> {
        let resolve = |p: &str| pbx_paths::join(request.working_directory, p);
        match request.executable {
            "cc" => {
                let (output, inputs) = match request.arguments {
                    [flag, output, inputs @ ..] if flag == "-o" => (output, inputs),
                    _ => return Ok(LaunchOutput::exited(2)),
                };
                let mut contents = Vec::new();
                for input in inputs {
                    match self.fs.read_all(&resolve(input)) {
                        Ok(bytes) => contents.extend(bytes),
                        Err(_) => return Ok(LaunchOutput::exited(1)),
                    }
                }
                self.fs
                    .write(&contents, &resolve(output))
                    .map_err(|source| LaunchError::Io {
                        path: output.clone(),
                        source,
                    })?;
                self.ran.lock().unwrap().push(output.clone());
                Ok(LaunchOutput::exited(0))
            }
            "false" => Ok(LaunchOutput {
                code: Some(1),
                stdout: vec![],
                stderr: b"error: false".to_vec(),
            }),
            other => Err(LaunchError::NotFound(other.to_owned())),
        }
    }
}

pub fn cc(output: &str, inputs: &[&str]) -> Invocation {
    let mut arguments = vec!["-o".to_owned(), output.to_owned()];
    arguments.extend(inputs.iter().map(|i| (*i).to_owned()));
    Invocation::new()
        .with_executable(Executable::determine("cc"))
        .with_arguments(arguments)
        .with_inputs(inputs.to_vec())
        .with_outputs(vec![output])
}

/// Records every callback as a line of text.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl BuildObserver for Recorder {
    fn started(&self, _id: InvocationId, invocation: &Invocation, reason: &Reason) {
        self.events
            .lock()
            .unwrap()
            .push(format!("start {}: {}", invocation.description(), reason));
    }

    fn skipped(&self, _id: InvocationId, invocation: &Invocation) {
        self.events
            .lock()
            .unwrap()
            .push(format!("skip {}", invocation.description()));
    }

    fn finished(
        &self,
        _id: InvocationId,
        invocation: &Invocation,
        result: Result<Option<&LaunchOutput>, &NodeError>,
    ) {
        let line = match result {
            Ok(_) => format!("done {}", invocation.description()),
            Err(e) => format!("fail {}: {}", invocation.description(), e),
        };
        self.events.lock().unwrap().push(line);
    }
}
