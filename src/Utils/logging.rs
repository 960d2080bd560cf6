//! logger setup shared by the solvers: console and/or file output through simplelog
use simplelog::*;
use std::fs::File;

/// where and how verbosely the solver writes its log
#[derive(Debug, Clone)]
pub struct SolverLogger {
    pub level: LevelFilter,
    pub console: bool,
    pub file: Option<String>,
}

impl Default for SolverLogger {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            console: true,
            file: None,
        }
    }
}

impl SolverLogger {
    /// parse "off", "error", "warn", "info", "debug" or "trace"
    pub fn level_from_str(level: &str) -> Option<LevelFilter> {
        match level.to_lowercase().as_str() {
            "off" | "none" => Some(LevelFilter::Off),
            "error" => Some(LevelFilter::Error),
            "warn" => Some(LevelFilter::Warn),
            "info" => Some(LevelFilter::Info),
            "debug" => Some(LevelFilter::Debug),
            "trace" => Some(LevelFilter::Trace),
            _ => None,
        }
    }

    /// Initialize the global logger. A logger installed earlier stays in place.
    pub fn init(&self) -> bool {
        if self.level == LevelFilter::Off {
            return false;
        }
        let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

        if self.console {
            loggers.push(TermLogger::new(
                self.level,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ));
        }

        if let Some(ref filename) = self.file {
            match File::create(filename) {
                Ok(file) => loggers.push(WriteLogger::new(self.level, Config::default(), file)),
                Err(e) => eprintln!("cannot create log file {}: {}", filename, e),
            }
        }

        if loggers.is_empty() {
            return false;
        }
        CombinedLogger::init(loggers).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        assert_eq!(SolverLogger::level_from_str("Debug"), Some(LevelFilter::Debug));
        assert_eq!(SolverLogger::level_from_str("none"), Some(LevelFilter::Off));
        assert_eq!(SolverLogger::level_from_str("loud"), None);
    }

    #[test]
    fn test_off_does_not_install() {
        let logger = SolverLogger {
            level: LevelFilter::Off,
            ..SolverLogger::default()
        };
        assert!(!logger.init());
    }
}
