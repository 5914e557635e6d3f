// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The log specification is taken from the RUST_LOG environment variable.
///
/// Logging from a logical thread while preemption is enabled is only safe inside a [crate::preempt::disabled] section,
/// because a forced yield may otherwise land while the logger holds its output lock.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Err(e) = Logger::try_with_env_or_str("").and_then(|logger| logger.start()) {
            eprintln!("initialize(): failed to start logger ({:?})", e);
        }
    });
}
