use core::fmt;

use crate::error::GmsError;

/// First DSFID of the application range; protocol kinds sit below it.
pub const APPLICATION_BASE: u16 = 1024;

/// Highest application kind that still fits into a DSFID.
pub const MAX_APPLICATION_KIND: u16 = u16::MAX - APPLICATION_BASE;

/// [`MessageKind`] closed set of message kinds. Each maps to a fixed numeric
/// discriminant (DSFID) that selects the handler and the payload schema.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    HeartbeatRequest,
    HeartbeatResponse,
    Suspect,
    FinalCheckRequest,
    FinalCheckResponse,
    JoinRequest,
    JoinResponse,
    LeaveRequest,
    RemoveMember,
    InstallView,
    /// Opaque application message; the value is the application's own type id.
    Application(u16),
}

impl MessageKind {
    /// Application kind `kind`, rejected if it does not fit the DSFID range.
    pub fn application(kind: u16) -> Result<Self, GmsError> {
        if kind > MAX_APPLICATION_KIND {
            return Err(GmsError::Codec(format!("application kind {} exceeds {}", kind, MAX_APPLICATION_KIND)));
        }
        Ok(MessageKind::Application(kind))
    }

    pub fn dsfid(&self) -> u16 {
        match self {
            MessageKind::Handshake => 1,
            MessageKind::HeartbeatRequest => 2,
            MessageKind::HeartbeatResponse => 3,
            MessageKind::Suspect => 4,
            MessageKind::FinalCheckRequest => 5,
            MessageKind::FinalCheckResponse => 6,
            MessageKind::JoinRequest => 7,
            MessageKind::JoinResponse => 8,
            MessageKind::LeaveRequest => 9,
            MessageKind::RemoveMember => 10,
            MessageKind::InstallView => 11,
            MessageKind::Application(kind) => APPLICATION_BASE.saturating_add(*kind),
        }
    }

    pub fn from_dsfid(dsfid: u16) -> Result<Self, GmsError> {
        match dsfid {
            1 => Ok(MessageKind::Handshake),
            2 => Ok(MessageKind::HeartbeatRequest),
            3 => Ok(MessageKind::HeartbeatResponse),
            4 => Ok(MessageKind::Suspect),
            5 => Ok(MessageKind::FinalCheckRequest),
            6 => Ok(MessageKind::FinalCheckResponse),
            7 => Ok(MessageKind::JoinRequest),
            8 => Ok(MessageKind::JoinResponse),
            9 => Ok(MessageKind::LeaveRequest),
            10 => Ok(MessageKind::RemoveMember),
            11 => Ok(MessageKind::InstallView),
            id if id >= APPLICATION_BASE => Ok(MessageKind::Application(id - APPLICATION_BASE)),
            _ => Err(GmsError::Codec(format!("unknown DSFID {}", dsfid))),
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, MessageKind::Application(_))
    }

    /// Kinds carried by the datagram transport; everything else needs the
    /// connection-oriented direct channel.
    pub fn is_datagram(&self) -> bool {
        matches!(
            self,
            MessageKind::HeartbeatRequest | MessageKind::HeartbeatResponse | MessageKind::Suspect
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Handshake => write!(f, "HANDSHAKE"),
            MessageKind::HeartbeatRequest => write!(f, "HEARTBEAT_REQUEST"),
            MessageKind::HeartbeatResponse => write!(f, "HEARTBEAT_RESPONSE"),
            MessageKind::Suspect => write!(f, "SUSPECT"),
            MessageKind::FinalCheckRequest => write!(f, "FINAL_CHECK_REQUEST"),
            MessageKind::FinalCheckResponse => write!(f, "FINAL_CHECK_RESPONSE"),
            MessageKind::JoinRequest => write!(f, "JOIN_REQUEST"),
            MessageKind::JoinResponse => write!(f, "JOIN_RESPONSE"),
            MessageKind::LeaveRequest => write!(f, "LEAVE_REQUEST"),
            MessageKind::RemoveMember => write!(f, "REMOVE_MEMBER"),
            MessageKind::InstallView => write!(f, "INSTALL_VIEW"),
            MessageKind::Application(kind) => write!(f, "APPLICATION({})", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsfids_are_stable() {
        assert_eq!(MessageKind::Handshake.dsfid(), 1);
        assert_eq!(MessageKind::InstallView.dsfid(), 11);
        assert_eq!(MessageKind::Application(3).dsfid(), APPLICATION_BASE + 3);
        assert_eq!(MessageKind::from_dsfid(APPLICATION_BASE + 3).unwrap(), MessageKind::Application(3));
        assert_eq!(MessageKind::from_dsfid(5).unwrap(), MessageKind::FinalCheckRequest);
        assert!(MessageKind::from_dsfid(0).is_err());
        assert!(MessageKind::from_dsfid(12).is_err());
    }

    #[test]
    fn test_application_range_is_bounded() {
        assert!(MessageKind::application(MAX_APPLICATION_KIND).is_ok());
        assert!(MessageKind::application(MAX_APPLICATION_KIND + 1).is_err());
    }
}
