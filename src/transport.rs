use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::error::SelectionError;

/// Largest payload the light transport accepts.
pub const LIGHT_CEILING: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
  /// Hosted bot API, capped at [`LIGHT_CEILING`].
  Light,
  /// Self-hosted bot API server without the upload cap.
  Capable,
}

impl fmt::Display for Transport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Transport::Light => f.write_str("light"),
      Transport::Capable => f.write_str("capable"),
    }
  }
}

/// Transports usable by this process, determined once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
  pub capable: bool,
}

pub fn choose(
  size: u64,
  caps: Capabilities,
) -> Result<Transport, SelectionError> {
  let transport = if size < LIGHT_CEILING {
    Transport::Light
  } else if caps.capable {
    Transport::Capable
  } else {
    return Err(SelectionError::CapacityExceeded {
      size,
      ceiling: LIGHT_CEILING,
    });
  };

  info!(size, %transport, "transport chosen");
  Ok(transport)
}

#[cfg(test)]
mod test {
  use super::*;

  const NONE: Capabilities = Capabilities { capable: false };
  const CAPABLE: Capabilities = Capabilities { capable: true };

  #[test]
  fn test_light_below_ceiling() {
    assert_eq!(choose(0, NONE), Ok(Transport::Light));
    assert_eq!(choose(LIGHT_CEILING - 1, NONE), Ok(Transport::Light));
    assert_eq!(choose(LIGHT_CEILING - 1, CAPABLE), Ok(Transport::Light));
  }

  #[test]
  fn test_at_ceiling() {
    assert_eq!(choose(LIGHT_CEILING, CAPABLE), Ok(Transport::Capable));
    assert_eq!(
      choose(LIGHT_CEILING, NONE),
      Err(SelectionError::CapacityExceeded {
        size: LIGHT_CEILING,
        ceiling: LIGHT_CEILING,
      })
    );
    assert_eq!(
      choose(2 * 1024 * 1024 * 1024, NONE).unwrap_err().code(),
      "capacity-exceeded"
    );
  }
}
