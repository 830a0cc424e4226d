// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_consts()?;
    Ok(())
}

/// Static kernel sizing, read from the `KERN_CONFIG` environment variable as a
/// RON document. Any field left out takes its default; leaving the variable
/// unset entirely gives you the defaults across the board, which is what host
/// tests use.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KernelConfig {
    max_processes: usize,
    grants_per_process: usize,
    max_drivers: usize,
    upcall_queue_len: usize,
    trace_depth: usize,
    max_allow_len: Option<usize>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 4,
            grants_per_process: 8,
            max_drivers: 16,
            upcall_queue_len: 8,
            trace_depth: 32,
            max_allow_len: None,
        }
    }
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_CONFIG");
    let kconfig: KernelConfig = match env::var("KERN_CONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };

    if kconfig.max_processes == 0
        || kconfig.max_processes > usize::from(u16::MAX)
    {
        return Err("max_processes must be between 1 and 65535".into());
    }
    if kconfig.upcall_queue_len == 0 {
        return Err("upcall_queue_len must be nonzero".into());
    }

    let out = &PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "pub const MAX_PROCESSES: usize = {};",
        kconfig.max_processes
    )?;
    writeln!(
        file,
        "pub const GRANTS_PER_PROCESS: usize = {};",
        kconfig.grants_per_process
    )?;
    writeln!(file, "pub const MAX_DRIVERS: usize = {};", kconfig.max_drivers)?;
    writeln!(
        file,
        "pub const UPCALL_QUEUE_LEN: usize = {};",
        kconfig.upcall_queue_len
    )?;
    writeln!(file, "pub const TRACE_DEPTH: usize = {};", kconfig.trace_depth)?;
    match kconfig.max_allow_len {
        Some(n) => writeln!(
            file,
            "pub const MAX_ALLOW_LEN: Option<usize> = Some({n});"
        )?,
        None => {
            writeln!(file, "pub const MAX_ALLOW_LEN: Option<usize> = None;")?
        }
    }

    Ok(())
}
