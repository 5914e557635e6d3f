// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    preempt,
};
use ::std::{
    fs,
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

// Runtime options. Every option may be overridden by an environment variable named after it.
mod runtime_config {
    pub const SECTION_NAME: &str = "uthread";
    pub const ENV_PREFIX: &str = "UTHREAD_";
    // Preemption frequency, in ticks per second.
    pub const PREEMPT_HZ: &str = "preempt_hz";
    // Stack size of logical threads, in bytes.
    pub const STACK_SIZE: &str = "stack_size";
}

/// Default stack size of logical threads.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size accepted. Anything below this does not fit the trampoline and a logging call.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Largest stack size accepted.
pub const MAX_STACK_SIZE: usize = 1024 * 1024 * 1024;

/// Largest preemption frequency accepted.
pub const MAX_PREEMPT_HZ: u32 = 10_000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration. Options missing from the document take their default value.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let config_s: String = match fs::read_to_string(config_path) {
            Ok(config_s) => config_s,
            Err(e) => {
                let cause: String = format!("failed to read config file (path={:?}, error={:?})", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(e.raw_os_error().unwrap_or(libc::EIO), &cause));
            },
        };
        config_s.parse()
    }

    /// Reads the preemption frequency from the environment variable first and then the underlying configuration.
    pub fn preempt_hz(&self) -> Result<u32, Fail> {
        let hz: u32 = match Self::get_typed_env_option(runtime_config::PREEMPT_HZ)? {
            Some(hz) => hz,
            None => self
                .get_int_option(runtime_config::PREEMPT_HZ)?
                .unwrap_or(preempt::DEFAULT_HZ),
        };
        if hz == 0 || hz > MAX_PREEMPT_HZ {
            let cause: String = format!("preemption frequency is out of range (hz={:?})", hz);
            error!("preempt_hz(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(hz)
    }

    /// Reads the stack size of logical threads from the environment variable first and then the underlying
    /// configuration.
    pub fn stack_size(&self) -> Result<usize, Fail> {
        let stack_size: usize = match Self::get_typed_env_option(runtime_config::STACK_SIZE)? {
            Some(stack_size) => stack_size,
            None => self
                .get_int_option(runtime_config::STACK_SIZE)?
                .unwrap_or(DEFAULT_STACK_SIZE),
        };
        if !(MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&stack_size) {
            let cause: String = format!("stack size is out of range (stack_size={:?})", stack_size);
            error!("stack_size(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(stack_size)
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Returns the runtime section, if the document has one.
    fn get_runtime_config(&self) -> Result<Option<&Yaml>, Fail> {
        match self.0.index(runtime_config::SECTION_NAME) {
            Yaml::BadValue | Yaml::Null => Ok(None),
            section @ Yaml::Hash(_) => Ok(Some(section)),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", runtime_config::SECTION_NAME);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index the runtime section to find the value at `index`, if present.
    fn get_option(&self, index: &str) -> Result<Option<&Yaml>, Fail> {
        match self.get_runtime_config()? {
            Some(section) => match section.index(index) {
                Yaml::BadValue | Yaml::Null => Ok(None),
                value => Ok(Some(value)),
            },
            None => Ok(None),
        }
    }

    /// Reads an integer option, verifying that the destination type may hold its value.
    fn get_int_option<T: TryFrom<i64>>(&self, index: &str) -> Result<Option<T>, Fail> {
        let option: &Yaml = match self.get_option(index)? {
            Some(option) => option,
            None => return Ok(None),
        };
        let val: i64 = match option.as_i64() {
            Some(val) => val,
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(Some(val)),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        let name: String = format!("{}{}", runtime_config::ENV_PREFIX, index.to_uppercase());
        if let Ok(var) = ::std::env::var(&name) {
            if let Ok(value) = var.trim().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("environment variable {} has unexpected value {:?}", name, var);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Null)
    }
}

impl FromStr for Config {
    type Err = Fail;

    fn from_str(config_s: &str) -> Result<Self, Self::Err> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match &config[..] {
            [] => Ok(Self::default()),
            [config_obj] => Ok(Self(config_obj.clone())),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
