use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use serde::Deserialize;

use crate::model::Language;

#[derive(Parser)]
#[command(name = "arbiter", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of judge workers, overriding the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;

        if let Some(workers) = self.workers {
            config.judge.workers = workers;
        }
        if config.judge.workers == 0 {
            return Err(anyhow!("The number of judge workers must not be 0"));
        }

        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    /// Overrides of the built-in toolchains
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// `isolate` when it is on PATH, plain processes otherwise
    #[default]
    Auto,
    Isolate,
    Process,
}

/// What the aggregator does after a wrong answer
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WrongAnswerMode {
    #[default]
    FailFast,
    /// Keep running to surface the worst resource usage over all cases
    RunAll,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    pub workers: usize,
    pub sandbox: SandboxKind,
    /// Root of per-submission scratch directories
    pub scratch_dir: Option<PathBuf>,
    pub time_grace_ms: u64,
    pub compile_timeout_ms: u64,
    pub compile_memory_kb: u64,
    /// Captured stdout beyond this is truncated
    pub output_limit_bytes: usize,
    pub diagnostics_limit_bytes: usize,
    /// Length of the stdout/stderr excerpts kept per test case
    pub excerpt_limit_bytes: usize,
    pub wrong_answer_mode: WrongAnswerMode,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            sandbox: SandboxKind::default(),
            scratch_dir: None,
            time_grace_ms: 200,
            compile_timeout_ms: 10_000,
            compile_memory_kb: 524_288,
            output_limit_bytes: 8 << 20,
            diagnostics_limit_bytes: 64 << 10,
            excerpt_limit_bytes: 1 << 10,
            wrong_answer_mode: WrongAnswerMode::default(),
        }
    }
}

impl JudgeConfig {
    pub fn time_grace(&self) -> Duration {
        Duration::from_millis(self.time_grace_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    /// Resolves the scratch root, falling back to the user cache directory
    pub fn scratch_root(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.scratch_dir {
            return Ok(dir.clone());
        }

        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "arbiter")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("scratch"))
    }
}

/// Toolchain of one language.
///
/// Commands are argument templates: `%INPUT%` is replaced with the source
/// file name and `%OUTPUT%` with the executable name, both relative to the
/// scratch directory.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub language: Language,
    pub file_name: String,
    /// Absent for interpreted languages
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

pub const EXECUTABLE_NAME: &str = "main";

impl LanguageConfig {
    fn builtin(language: Language) -> Self {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        match language {
            Language::C => Self {
                language,
                file_name: "main.c".to_string(),
                compile: Some(args(&[
                    "gcc", "-O2", "-std=c11", "-o", "%OUTPUT%", "%INPUT%", "-lm",
                ])),
                run: args(&["./%OUTPUT%"]),
            },
            Language::Cpp => Self {
                language,
                file_name: "main.cpp".to_string(),
                compile: Some(args(&[
                    "g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%",
                ])),
                run: args(&["./%OUTPUT%"]),
            },
            Language::Pascal => Self {
                language,
                file_name: "main.pas".to_string(),
                compile: Some(args(&["fpc", "-O2", "-o%OUTPUT%", "%INPUT%"])),
                run: args(&["./%OUTPUT%"]),
            },
            Language::Python => Self {
                language,
                file_name: "main.py".to_string(),
                compile: None,
                run: args(&["python3", "%INPUT%"]),
            },
        }
    }

    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|c| self.apply_template(c))
    }

    pub fn run_command(&self) -> Vec<String> {
        self.apply_template(&self.run)
    }

    fn apply_template(&self, cmd_template: &[String]) -> Vec<String> {
        cmd_template
            .iter()
            .map(|s| {
                s.replace("%INPUT%", &self.file_name)
                    .replace("%OUTPUT%", EXECUTABLE_NAME)
            })
            .collect()
    }
}

/// Toolchains for every supported language
#[derive(Debug, Clone)]
pub struct LanguageTable {
    languages: HashMap<Language, LanguageConfig>,
}

impl LanguageTable {
    /// Built-in toolchains, replaced by any configured override
    pub fn with_overrides(overrides: Vec<LanguageConfig>) -> Self {
        let mut languages: HashMap<Language, LanguageConfig> = Language::ALL
            .into_iter()
            .map(|l| (l, LanguageConfig::builtin(l)))
            .collect();

        for config in overrides {
            log::info!("Using configured toolchain for {}", config.language);
            languages.insert(config.language, config);
        }

        Self { languages }
    }

    pub fn get(&self, language: Language) -> &LanguageConfig {
        // every language gets a builtin entry at construction
        &self.languages[&language]
    }
}

impl Default for LanguageTable {
    fn default() -> Self {
        Self::with_overrides(Vec::new())
    }
}
