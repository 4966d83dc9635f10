//! Opcode registry
//!
//! Every message type on the wire is identified by a 16-bit opcode. The
//! registry is a closed enum generated by the `opcodes!` macro below, so the
//! name -> integer direction is total at compile time and the integer -> name
//! direction is a plain `Option` lookup.
//!
//! Integers without an entry are normal traffic from newer or older clients,
//! not corruption. Callers drop those packets and carry on.

use std::fmt;
use std::str::FromStr;

macro_rules! opcodes {
    (@label $name:ident) => {
        stringify!($name)
    };
    (@label $name:ident $label:literal) => {
        $label
    };
    ($( $(#[$meta:meta])* $name:ident = $value:literal $(=> $label:literal)? ),* $(,)?) => {
        /// Symbolic identity of a wire message type
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum Opcode {
            $( $(#[$meta])* $name = $value, )*
        }

        impl Opcode {
            /// Every registered opcode, in declaration order
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Wire value of this opcode
            pub const fn as_u16(self) -> u16 {
                self as u16
            }

            /// Look up a wire value. `None` means the peer speaks a message
            /// this build does not know about.
            pub const fn from_u16(value: u16) -> Option<Opcode> {
                match value {
                    $( $value => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Symbolic identity, e.g. `ServerHello`
            pub const fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => stringify!($name), )*
                }
            }

            /// Human-readable label for diagnostics. Falls back to the
            /// symbolic identity when no label was registered.
            pub const fn display_name(self) -> &'static str {
                match self {
                    $( Opcode::$name => opcodes!(@label $name $($label)?), )*
                }
            }

            /// Look up an opcode by its symbolic identity
            pub fn from_name(name: &str) -> Option<Opcode> {
                Self::ALL.iter().copied().find(|opcode| opcode.name() == name)
            }
        }
    };
}

opcodes! {
    /// Greeting sent by the server right after accept
    ServerHello = 0x0003 => "Server Hello",
    /// Periodic keep-alive from the client
    ClientHeartbeat = 0x0241 => "Client Heartbeat",
    /// Server reply to a heartbeat
    ServerHeartbeat = 0x0242 => "Server Heartbeat",
    /// Realm hand-off hello, recognised but not served by the auth gateway
    ClientHelloRealm = 0x058F,
    /// Authentication succeeded
    ServerAuthAccepted = 0x0591 => "Server Auth Accepted",
    /// Client credentials for the auth gateway
    ClientHelloAuth = 0x0592 => "Client Hello (Auth)",
    /// Authentication refused
    ServerAuthDenied = 0x063D => "Server Auth Denied",
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.display_name(), self.as_u16())
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> u16 {
        opcode.as_u16()
    }
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Opcode::from_u16(value).ok_or(value)
    }
}

/// Error returned when parsing an unknown opcode name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown opcode name: {0}")]
pub struct UnknownOpcodeName(pub String);

impl FromStr for Opcode {
    type Err = UnknownOpcodeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Opcode::from_name(s).ok_or_else(|| UnknownOpcodeName(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_totality() {
        for &opcode in Opcode::ALL {
            assert_eq!(Opcode::from_u16(opcode.as_u16()), Some(opcode));
            assert_eq!(Opcode::from_name(opcode.name()), Some(opcode));
        }
    }

    #[test]
    fn test_unknown_values() {
        let registered: Vec<u16> = Opcode::ALL.iter().map(|o| o.as_u16()).collect();
        for value in 0..=u16::MAX {
            if !registered.contains(&value) {
                assert_eq!(Opcode::from_u16(value), None, "value 0x{:04X}", value);
            }
        }
    }

    #[test]
    fn test_wire_values_are_unique() {
        let mut values: Vec<u16> = Opcode::ALL.iter().map(|o| o.as_u16()).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), Opcode::ALL.len());
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(Opcode::ServerHello.display_name(), "Server Hello");
        assert_eq!(Opcode::ClientHelloRealm.display_name(), "ClientHelloRealm");
        assert_eq!(Opcode::ServerHello.as_u16(), 0x0003);
    }

    #[test]
    fn test_parse_by_name() {
        assert_eq!("ClientHelloAuth".parse::<Opcode>(), Ok(Opcode::ClientHelloAuth));
        assert!("NotAnOpcode".parse::<Opcode>().is_err());
        assert_eq!(Opcode::try_from(0x0592), Ok(Opcode::ClientHelloAuth));
        assert_eq!(Opcode::try_from(0xBEEF), Err(0xBEEF));
    }
}
