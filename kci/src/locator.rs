// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{collections::HashMap, path::PathBuf};

use kci_common::syscalls::{prefix_uses_wrapper, SYS_close, HANDLER_PREFIXES};
use log::{debug, trace, warn};

use crate::{error::KciError, kcore::Kcore};

pub const TABLE_SYMBOL: &str = "sys_call_table";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerSymbol {
    pub name: String,
    pub address: u64,
}

/// The live syscall dispatch table and the handlers we care about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchTable {
    pub address: u64,
    pub prefix: &'static str,
    pub read: HandlerSymbol,
    pub write: HandlerSymbol,
    pub close: HandlerSymbol,
}

impl DispatchTable {
    pub fn uses_wrapper(&self) -> bool {
        prefix_uses_wrapper(self.prefix)
    }

    /// Address of the table entry for syscall `nr`.
    pub fn slot_address(&self, nr: i64) -> u64 {
        self.address + nr as u64 * std::mem::size_of::<u64>() as u64
    }
}

/// Picks out the symbols of interest from kallsyms / System.map formatted text:
/// `<hex address> <type> <name> [module]`.
fn parse_symbols(text: &str) -> HashMap<&str, u64> {
    let wanted = |name: &str| {
        name == TABLE_SYMBOL
            || HANDLER_PREFIXES.iter().any(|prefix| {
                name.strip_prefix(prefix)
                    .is_some_and(|rest| matches!(rest, "read" | "write" | "close"))
            })
    };

    let mut symbols = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(address), Some(_kind), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        // Module symbols never hold the core syscall table.
        if fields.next().is_some() || !wanted(name) {
            continue;
        }

        let Ok(address) = u64::from_str_radix(address, 16) else {
            continue;
        };

        symbols.entry(name).or_insert(address);
    }

    symbols
}

/// Every table candidate described by `text`, most specific ABI first.
pub fn scan(text: &str) -> Vec<DispatchTable> {
    let symbols = parse_symbols(text);

    let Some(&address) = symbols.get(TABLE_SYMBOL) else {
        return vec![];
    };

    // Without kernel pointer access every address reads as zero.
    if address == 0 {
        return vec![];
    }

    let handler = |prefix: &str, op: &str| {
        let name = format!("{prefix}{op}");
        symbols
            .get(name.as_str())
            .filter(|&&address| address != 0)
            .map(|&address| HandlerSymbol { name, address })
    };

    HANDLER_PREFIXES
        .iter()
        .filter_map(|&prefix| {
            Some(DispatchTable {
                address,
                prefix,
                read: handler(prefix, "read")?,
                write: handler(prefix, "write")?,
                close: handler(prefix, "close")?,
            })
        })
        .collect()
}

/// Checks the candidate's close slot against the close handler's address.
pub fn verify(table: &DispatchTable, kcore: &Kcore) -> Result<bool, KciError> {
    let entry = kcore.read_u64(table.slot_address(SYS_close))?;
    trace!(
        "slot {SYS_close} of table at {:#x} holds {entry:#x}, {} is at {:#x}",
        table.address,
        table.close.name,
        table.close.address
    );
    Ok(entry == table.close.address)
}

/// Finds the dispatch table, trying each symbol source in order.
///
/// When kernel memory cannot be read the known-good entry check is skipped and the
/// first candidate with a complete set of handler symbols is accepted.
pub fn locate(sources: &[PathBuf], kcore: Option<&Kcore>) -> Result<DispatchTable, KciError> {
    if kcore.is_none() {
        warn!("Kernel memory is not readable, dispatch table entries will not be verified");
    }

    for source in sources {
        let text = match std::fs::read_to_string(source) {
            Ok(text) => text,
            Err(e) => {
                debug!("Skipping symbol source {}: {e}", source.display());
                continue;
            }
        };

        for candidate in scan(&text) {
            let Some(kcore) = kcore else {
                debug!(
                    "Accepting unverified table at {:#x} from {}",
                    candidate.address,
                    source.display()
                );
                return Ok(candidate);
            };

            match verify(&candidate, kcore) {
                Ok(true) => {
                    debug!(
                        "Table at {:#x} from {} verified through {}",
                        candidate.address,
                        source.display(),
                        candidate.close.name
                    );
                    return Ok(candidate);
                }
                Ok(false) => debug!(
                    "Close slot of {:#x} does not point at {}, trying next candidate",
                    candidate.address, candidate.close.name
                ),
                Err(e) => debug!("Could not verify table at {:#x}: {e}", candidate.address),
            }
        }
    }

    Err(KciError::TableNotFound {
        searched: sources.to_vec(),
    })
}
