/// How to execute one language inside the sandbox.
///
/// `command` is an argv template: `{entry}` resolves to the mounted source
/// file and `{work}` to a writable directory for compiled byproducts.
/// `entry_file` is fixed per language; java in particular requires the file
/// name to match the top-level class (`Main.java`).
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    pub language: String,
    pub image: String,
    pub entry_file: String,
    pub command: Vec<String>,
}

impl RuntimeProfile {
    fn new(language: &str, image: &str, entry_file: &str, command: &[&str]) -> Self {
        Self {
            language: language.to_string(),
            image: image.to_string(),
            entry_file: entry_file.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Resolve the argv template against concrete paths
    pub fn resolve_command(&self, entry: &str, work: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace("{entry}", entry).replace("{work}", work))
            .collect()
    }
}

/// The built-in language registry. Static at runtime; deployments extend it
/// by constructing the orchestrator with additional profiles.
pub fn default_profiles() -> Vec<RuntimeProfile> {
    vec![
        RuntimeProfile::new("javascript", "node:18-alpine", "code.js", &["node", "{entry}"]),
        RuntimeProfile::new("python", "python:3.10-alpine", "code.py", &["python3", "{entry}"]),
        RuntimeProfile::new(
            "cpp",
            "gcc:latest",
            "code.cpp",
            &["sh", "-c", "g++ {entry} -o {work}/a.out && {work}/a.out"],
        ),
        RuntimeProfile::new(
            "java",
            "openjdk:17-alpine",
            "Main.java",
            &["sh", "-c", "javac -d {work} {entry} && java -cp {work} Main"],
        ),
    ]
}
