// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options.
mod scheduler_config {
    pub const SECTION_NAME: &str = "parallex";
    // Number of workers (OS threads), including the one that calls into the runtime.
    pub const WORKER_COUNT: &str = "worker_count";
    // Size of every lightweight thread's stack.
    pub const STACK_BYTES: &str = "stack_bytes";
}

/// Prefix of environment variables that override configuration file options.
const ENV_PREFIX: &str = "PARALLEX_";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Scheduler settings, resolved once from a [Config] and immutable afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub stack_bytes: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration from a YAML document.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration (error={:?})", e);
                error!("from_yaml_str(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self { 0: config_obj.clone() })
    }

    fn get_scheduler_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, scheduler_config::SECTION_NAME)
    }

    /// Reads the number of workers from the environment first, then from the configuration file. When neither
    /// provides it, one worker per available hardware thread is used.
    pub fn worker_count(&self) -> Result<usize, Fail> {
        if let Some(count) = Self::get_typed_env_option(scheduler_config::WORKER_COUNT)? {
            return Ok(count);
        }
        match self.get_scheduler_config() {
            Ok(section) if !section.index(scheduler_config::WORKER_COUNT).is_badvalue() => {
                Self::get_int_option(section, scheduler_config::WORKER_COUNT)
            },
            _ => Ok(::std::thread::available_parallelism().map_or(1, |n| n.get())),
        }
    }

    /// Reads the lightweight thread stack size from the environment first, then from the configuration file.
    pub fn stack_bytes(&self) -> Result<usize, Fail> {
        if let Some(bytes) = Self::get_typed_env_option(scheduler_config::STACK_BYTES)? {
            return Ok(bytes);
        }
        match self.get_scheduler_config() {
            Ok(section) if !section.index(scheduler_config::STACK_BYTES).is_badvalue() => {
                Self::get_int_option(section, scheduler_config::STACK_BYTES)
            },
            _ => Ok(limits::DEFAULT_STACK_BYTES),
        }
    }

    /// Resolves and validates the scheduler settings.
    pub fn scheduler(&self) -> Result<SchedulerConfig, Fail> {
        SchedulerConfig::new(self.worker_count()?, self.stack_bytes()?)
    }

    /// Index `yaml` to find the subsection at `index`, validating that it is a hash.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Reads `PARALLEX_<INDEX>` from the environment, if it is set.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        let name: String = format!("{}{}", ENV_PREFIX, index.to_uppercase());
        if let Ok(var) = ::std::env::var(&name) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", name);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads an integer option, verifying that the destination type may hold it.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = match Self::get_option(yaml, index)?.as_i64() {
            Some(val) => val,
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

impl SchedulerConfig {
    /// Validates scheduler settings.
    pub fn new(worker_count: usize, stack_bytes: usize) -> Result<Self, Fail> {
        if worker_count == 0 || worker_count > limits::MAX_WORKERS {
            let cause: String = format!(
                "worker count must be between 1 and {} (worker_count={})",
                limits::MAX_WORKERS,
                worker_count
            );
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if stack_bytes < limits::MIN_STACK_BYTES {
            let cause: String = format!(
                "stack size must be at least {} bytes (stack_bytes={})",
                limits::MIN_STACK_BYTES,
                stack_bytes
            );
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(Self {
            worker_count,
            stack_bytes,
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Hash(Default::default()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Config,
        SchedulerConfig,
    };
    use crate::runtime::limits;
    use ::anyhow::Result;

    #[test]
    fn reads_scheduler_section() -> Result<()> {
        let config: Config = Config::from_yaml_str("parallex:\n  worker_count: 3\n  stack_bytes: 65536\n")?;
        crate::ensure_eq!(config.worker_count()?, 3);
        crate::ensure_eq!(config.stack_bytes()?, 65536);
        crate::ensure_eq!(
            config.scheduler()?,
            SchedulerConfig {
                worker_count: 3,
                stack_bytes: 65536
            }
        );
        Ok(())
    }

    #[test]
    fn missing_options_fall_back_to_defaults() -> Result<()> {
        let config: Config = Config::from_yaml_str("other: 1\n")?;
        crate::ensure_eq!(config.stack_bytes()?, limits::DEFAULT_STACK_BYTES);
        crate::ensure_eq!(config.worker_count()? >= 1, true);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_settings() -> Result<()> {
        crate::ensure_eq!(SchedulerConfig::new(0, limits::DEFAULT_STACK_BYTES).is_err(), true);
        crate::ensure_eq!(SchedulerConfig::new(2, 1024).is_err(), true);
        let config: Config = Config::from_yaml_str("parallex:\n  stack_bytes: -5\n")?;
        crate::ensure_eq!(config.stack_bytes().is_err(), true);
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> Result<()> {
        ::std::env::set_var("PARALLEX_ENV_ONLY_TEST_KEY", "17");
        let value: Option<usize> = Config::get_typed_env_option("env_only_test_key")?;
        crate::ensure_eq!(value, Some(17));
        ::std::env::set_var("PARALLEX_ENV_ONLY_TEST_KEY", "seventeen");
        crate::ensure_eq!(Config::get_typed_env_option::<usize>("env_only_test_key").is_err(), true);
        ::std::env::remove_var("PARALLEX_ENV_ONLY_TEST_KEY");
        Ok(())
    }
}
