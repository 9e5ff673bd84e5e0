//! Build-time version constants and the synthesized `VersionResponse`.
//!
//! These are process-wide constants (`spec.md` §9: "Process-wide state"),
//! fixed at build time rather than read from configuration.

use crate::proto_gen::host::VersionResponse;

/// Wire protocol version this binary implements.
pub const PROTOCOL_VERSION: &str = "1";

/// Version of the underlying compilation engine (`spec.md` §6.1).
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of this host binary itself.
pub const IMPLEMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stable, human-readable implementation name.
pub const IMPLEMENTATION_NAME: &str = "stylesheet-compiler-host";

pub fn response(id: u32) -> VersionResponse {
    VersionResponse {
        id,
        protocol_version: PROTOCOL_VERSION.to_string(),
        compiler_version: COMPILER_VERSION.to_string(),
        implementation_version: IMPLEMENTATION_VERSION.to_string(),
        implementation_name: IMPLEMENTATION_NAME.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_response_is_deterministic() {
        let a = response(7);
        let b = response(7);
        assert_eq!(a, b);
        assert_eq!(a.id, 7);
        assert_eq!(a.implementation_name, IMPLEMENTATION_NAME);
    }
}
