use crate::config::types::{AccessedAddrs, DiscoveryError, Result};
use crate::core::tracker::AddressTracker;
use crate::safety::cleanup::{TeardownReport, TraceeGuard};

/// Turns the end state of one call into its result.
///
/// Teardown happens before anything is returned, on every outcome.
#[derive(Debug, Clone, Copy)]
pub struct ResultAssembler {
    pub code_location: u64,
    pub block_size: u64,
}

/// Result of one call together with what teardown did.
#[derive(Debug)]
pub struct Assembled {
    pub result: Result<AccessedAddrs>,
    pub teardown: Option<TeardownReport>,
}

impl ResultAssembler {
    pub fn finish(
        &self,
        tracee: &mut TraceeGuard,
        tracker: AddressTracker,
        outcome: Result<()>,
    ) -> Assembled {
        let teardown = tracee.teardown();

        let result = match (outcome, &teardown) {
            (Err(err), Err(teardown_err)) => {
                log::warn!("Teardown after failed discovery also failed: {}", teardown_err);
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
            (Ok(()), Ok(_)) => Ok(AccessedAddrs {
                code_location: self.code_location,
                block_size: self.block_size,
                accessed_blocks: tracker.into_blocks(),
            }),
            (Ok(()), Err(teardown_err)) => Err(DiscoveryError::SandboxSetup(format!(
                "teardown failed: {}",
                teardown_err
            ))),
        };

        Assembled {
            result,
            teardown: teardown.ok(),
        }
    }
}
