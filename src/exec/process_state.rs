//! One-time process-wide initialisation.
//!
//! Logging, the randomness source and the memory-usage snapshot are set up
//! once per process. Every accessor is idempotent: later calls return the
//! value produced by the first successful one.

use crate::config::types::{Result, RunkError};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

pub const RANDOM_DEVICE: &str = "/dev/urandom";
pub const MEMINFO: &str = "/proc/meminfo";

/// Default log filter when neither `RUST_LOG` nor an explicit level is set.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Pre-opened randomness device.
#[derive(Debug)]
pub struct RandomSource {
    file: Mutex<File>,
}

impl RandomSource {
    fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut sample = [0u8; 8];
        file.read_exact(&mut sample)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn fill(&self, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.read_exact(buf)?;
        Ok(())
    }
}

/// Host memory figures used for usage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageAccounting {
    pub total_memory_bytes: u64,
}

impl UsageAccounting {
    /// Parse `MemTotal` out of `/proc/meminfo` contents.
    pub fn from_meminfo(meminfo: &str) -> Result<Self> {
        let line = meminfo
            .lines()
            .find(|l| l.starts_with("MemTotal:"))
            .ok_or_else(|| RunkError::KernelInit("MemTotal missing from meminfo".to_string()))?;

        let mut fields = line["MemTotal:".len()..].split_whitespace();
        let value: u64 = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RunkError::KernelInit(format!("bad MemTotal line {:?}", line)))?;
        let multiplier = match fields.next() {
            Some("kB") | Some("KB") => 1024,
            None => 1,
            Some(unit) => {
                return Err(RunkError::KernelInit(format!("unknown MemTotal unit {:?}", unit)))
            }
        };

        Ok(Self {
            total_memory_bytes: value.saturating_mul(multiplier),
        })
    }
}

static RANDOMNESS: OnceLock<RandomSource> = OnceLock::new();
static USAGE: OnceLock<UsageAccounting> = OnceLock::new();
static LOGGING: OnceLock<()> = OnceLock::new();

/// The shared randomness source, opened on first use.
pub fn randomness() -> Result<&'static RandomSource> {
    if let Some(source) = RANDOMNESS.get() {
        return Ok(source);
    }
    let source = RandomSource::open(Path::new(RANDOM_DEVICE))?;
    Ok(RANDOMNESS.get_or_init(|| source))
}

/// Host memory snapshot, taken on first use.
pub fn usage_accounting() -> Result<&'static UsageAccounting> {
    if let Some(usage) = USAGE.get() {
        return Ok(usage);
    }
    let meminfo = std::fs::read_to_string(MEMINFO)?;
    let usage = UsageAccounting::from_meminfo(&meminfo)?;
    Ok(USAGE.get_or_init(|| usage))
}

/// Initialise the logger. `RUST_LOG` wins over `filter`, which wins over
/// the `warn` default. A logger installed elsewhere is left alone.
pub fn init_logging(filter: Option<&str>) {
    LOGGING.get_or_init(|| {
        let default = filter.unwrap_or(DEFAULT_LOG_FILTER);
        let env = env_logger::Env::default().default_filter_or(default);
        if env_logger::Builder::from_env(env).try_init().is_err() {
            log::debug!("Logger already installed");
        }
    });
}

/// Everything that must happen once before any bootstrap.
pub fn initialize_process_wide_state(log_filter: Option<&str>) -> Result<()> {
    init_logging(log_filter);
    randomness()?;
    let usage = usage_accounting()?;
    log::debug!("Host memory: {} bytes", usage.total_memory_bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meminfo_parsing() {
        let usage = UsageAccounting::from_meminfo(
            "MemTotal:       16318480 kB\nMemFree:         1000 kB\n",
        )
        .unwrap();
        assert_eq!(usage.total_memory_bytes, 16318480 * 1024);
    }

    #[test]
    fn test_meminfo_missing_total() {
        assert!(UsageAccounting::from_meminfo("MemFree: 1 kB\n").is_err());
        assert!(UsageAccounting::from_meminfo("MemTotal: lots kB\n").is_err());
        assert!(UsageAccounting::from_meminfo("MemTotal: 1 GB\n").is_err());
    }

    #[test]
    fn test_accessors_are_idempotent() {
        let a = randomness().unwrap() as *const RandomSource;
        let b = randomness().unwrap() as *const RandomSource;
        assert_eq!(a, b);
        assert_eq!(usage_accounting().unwrap(), usage_accounting().unwrap());
    }

    #[test]
    fn test_randomness_fills() {
        let mut buf = [0u8; 32];
        randomness().unwrap().fill(&mut buf).unwrap();
        // 32 zero bytes from urandom is not a realistic outcome.
        assert!(buf.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_initialize_twice() {
        initialize_process_wide_state(Some("debug")).unwrap();
        initialize_process_wide_state(None).unwrap();
    }
}
