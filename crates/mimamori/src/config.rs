use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::output::Forward;
use crate::supervisor::SupervisorConfig;

/// On-disk description of a supervised program.
///
/// ```toml
/// program = "./target/debug/server"
/// args = ["--port", "8080"]
/// working_dir = "."
/// kill_all_on_stop = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgramFile {
	pub program: String,
	pub args: Vec<String>,
	pub working_dir: Option<String>,
	pub kill_all_on_stop: bool,
}

impl ProgramFile {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
		Self::from_toml(&content).map_err(|e| match e {
			Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
			other => other,
		})
	}

	pub fn from_toml(content: &str) -> Result<Self> {
		toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
	}

	pub fn into_config(
		self,
		exit_signal: watch::Receiver<bool>,
		forward: Option<Forward>,
	) -> SupervisorConfig {
		let args = if self.args.is_empty() {
			None
		} else {
			let args = self.args;
			Some(Arc::new(move || args.clone()) as crate::ArgsProvider)
		};

		SupervisorConfig {
			program: PathBuf::from(self.program),
			args,
			working_dir: self.working_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
			exit_signal,
			forward,
			kill_all_on_stop: self.kill_all_on_stop,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_file() {
		let file = ProgramFile::from_toml(
			r#"
program = "/usr/local/bin/server"
args = ["--port", "8080"]
working_dir = "/srv"
kill_all_on_stop = true
"#,
		)
		.unwrap();

		assert_eq!(file.program, "/usr/local/bin/server");
		assert_eq!(file.args, vec!["--port", "8080"]);
		assert_eq!(file.working_dir.as_deref(), Some("/srv"));
		assert!(file.kill_all_on_stop);
	}

	#[test]
	fn missing_fields_take_defaults() {
		let file = ProgramFile::from_toml(r#"program = "app""#).unwrap();
		assert!(file.args.is_empty());
		assert_eq!(file.working_dir, None);
		assert!(!file.kill_all_on_stop);
	}

	#[test]
	fn rejects_bad_toml() {
		let err = ProgramFile::from_toml("program = [").unwrap_err();
		assert!(matches!(err, Error::Config(_)));
	}

	#[test]
	fn load_reports_missing_file() {
		let err = ProgramFile::load(Path::new("/no/such/mimamori.toml")).unwrap_err();
		assert!(err.to_string().contains("/no/such/mimamori.toml"));
	}

	#[test]
	fn into_config_builds_args_provider() {
		let (_tx, rx) = watch::channel(false);
		let file = ProgramFile {
			program: "app".into(),
			args: vec!["a".into(), "b".into()],
			working_dir: Some(String::new()),
			kill_all_on_stop: false,
		};

		let config = file.into_config(rx, None);
		assert_eq!(config.program, PathBuf::from("app"));
		assert!(config.working_dir.is_none());
		let provide = config.args.expect("args provider");
		assert_eq!(provide(), vec!["a", "b"]);
		assert_eq!(provide(), vec!["a", "b"]);
	}
}
