pub mod fingerprint;
pub mod outcome;
pub mod proxy;
pub mod session;
pub mod stats;

pub use fingerprint::*;
pub use outcome::*;
pub use proxy::*;
pub use session::*;
pub use stats::*;
