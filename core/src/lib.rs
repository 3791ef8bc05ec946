// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Partition-parallel hash join with a worker-wide cache of replicated
//! build sides.

#![deny(clippy::clone_on_ref_ptr)]

use log::{info, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{load_config_file, Appender, Deserializers, Root},
    encode::pattern::PatternEncoder,
    Config,
};

use crate::errors::{CometError, CometResult};

pub mod errors;
pub mod execution;

/// Installs the global logger from a log4rs config file, or the default
/// console logger when `log_conf_path` is `None` or empty. Later calls
/// leave the installed logger in place.
pub fn init_logging(log_conf_path: Option<&str>) -> CometResult<()> {
    let log_config = match log_conf_path {
        Some(path) if !path.is_empty() => load_config_file(path, Deserializers::default())
            .map_err(|err| CometError::Config(err.to_string()))?,
        _ => default_logger_config()?,
    };

    if log4rs::init_config(log_config).is_ok() {
        info!("Comet hash join logging initialized");
    }
    Ok(())
}

const LOG_PATTERN: &str = "{d(%y/%m/%d %H:%M:%S)} {l} {f}: {m}{n}";

// Creates a default log4rs config, which logs to stderr with `INFO` level.
fn default_logger_config() -> CometResult<Config> {
    let console_append = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let appender = Appender::builder().build("console", Box::new(console_append));
    let root = Root::builder().appender("console").build(LevelFilter::Info);
    Config::builder()
        .appender(appender)
        .build(root)
        .map_err(|err| CometError::Config(err.to_string()))
}
