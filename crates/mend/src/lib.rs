//! mend - test-verified source repair
//!
//! Library components for the `mend` binary: the verifier, the patch
//! proposer seam, and the retry loop that ties them together.

pub mod process;
pub mod proposer;
pub mod session;
pub mod verifier;

pub use proposer::{CommandProposer, LineRange, PatchProposer, Proposal, ProposalError, ProposerConfig};
pub use session::{decide, Decision, RepairRequest, RepairSession, SessionError, SessionOutcome};
pub use verifier::{Verification, Verifier, VerifierConfig, VerifyRequest};
