/*
 * deployer/runtime - process plumbing shared by the syncer and the
 * operator: leader election, shutdown on signals and log setup.
 */

pub mod errors;
pub use errors::LeaderElectionError;

pub mod lease;
pub use lease::LeaderElector;
pub use lease::LeaderGuard;
pub use lease::LeaseTimers;

pub mod logging;
pub use logging::init_logger;

pub mod shutdown;
pub use shutdown::shutdown_token;

use gethostname::gethostname;

/*
 * The identity this replica uses as lease holder: the pod name when the
 * downward API exposes it, otherwise the host name.
 */
pub fn identity() -> String {
    if let Ok(name) = std::env::var("POD_NAME") {
	if !name.is_empty() {
	    return name;
	}
    }

    gethostname().to_string_lossy().into_owned()
}
