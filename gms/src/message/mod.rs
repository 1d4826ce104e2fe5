// Membership protocol messages and their envelope.
use serde::{Deserialize, Serialize};

use crate::error::GmsError;
use crate::member::{MemberIdentifier, Version};
use crate::view::MembershipView;

pub use kind::{MessageKind, APPLICATION_BASE, MAX_APPLICATION_KIND};

mod kind;

/// First frame of every direct channel connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub identity: MemberIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequestPayload {
    pub request_id: u64,
    pub target: MemberIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponsePayload {
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectEntry {
    pub suspect: MemberIdentifier,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectPayload {
    pub suspects: Vec<SuspectEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalCheckRequestPayload {
    pub request_id: u64,
    pub target: MemberIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalCheckResponsePayload {
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequestPayload {
    pub member: MemberIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinResponsePayload {
    /// The coordinator admitted the joiner; the view contains it.
    Accepted(MembershipView),
    /// The contacted member is not the coordinator.
    Redirect(MemberIdentifier),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequestPayload {
    pub member: MemberIdentifier,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveMemberPayload {
    pub member: MemberIdentifier,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallViewPayload {
    pub view: MembershipView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPayload {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakePayload),
    HeartbeatRequest(HeartbeatRequestPayload),
    HeartbeatResponse(HeartbeatResponsePayload),
    Suspect(SuspectPayload),
    FinalCheckRequest(FinalCheckRequestPayload),
    FinalCheckResponse(FinalCheckResponsePayload),
    JoinRequest(JoinRequestPayload),
    JoinResponse(JoinResponsePayload),
    LeaveRequest(LeaveRequestPayload),
    RemoveMember(RemoveMemberPayload),
    InstallView(InstallViewPayload),
    Application(ApplicationPayload),
}

impl Payload {
    /// Serializes the payload body; the kind travels in the envelope header.
    pub(crate) fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            Payload::Handshake(p) => bincode::serialize(p),
            Payload::HeartbeatRequest(p) => bincode::serialize(p),
            Payload::HeartbeatResponse(p) => bincode::serialize(p),
            Payload::Suspect(p) => bincode::serialize(p),
            Payload::FinalCheckRequest(p) => bincode::serialize(p),
            Payload::FinalCheckResponse(p) => bincode::serialize(p),
            Payload::JoinRequest(p) => bincode::serialize(p),
            Payload::JoinResponse(p) => bincode::serialize(p),
            Payload::LeaveRequest(p) => bincode::serialize(p),
            Payload::RemoveMember(p) => bincode::serialize(p),
            Payload::InstallView(p) => bincode::serialize(p),
            Payload::Application(p) => bincode::serialize(p),
        }
    }

    pub(crate) fn deserialize(kind: MessageKind, bytes: &[u8]) -> Result<Self, bincode::Error> {
        Ok(match kind {
            MessageKind::Handshake => Payload::Handshake(bincode::deserialize(bytes)?),
            MessageKind::HeartbeatRequest => Payload::HeartbeatRequest(bincode::deserialize(bytes)?),
            MessageKind::HeartbeatResponse => Payload::HeartbeatResponse(bincode::deserialize(bytes)?),
            MessageKind::Suspect => Payload::Suspect(bincode::deserialize(bytes)?),
            MessageKind::FinalCheckRequest => Payload::FinalCheckRequest(bincode::deserialize(bytes)?),
            MessageKind::FinalCheckResponse => Payload::FinalCheckResponse(bincode::deserialize(bytes)?),
            MessageKind::JoinRequest => Payload::JoinRequest(bincode::deserialize(bytes)?),
            MessageKind::JoinResponse => Payload::JoinResponse(bincode::deserialize(bytes)?),
            MessageKind::LeaveRequest => Payload::LeaveRequest(bincode::deserialize(bytes)?),
            MessageKind::RemoveMember => Payload::RemoveMember(bincode::deserialize(bytes)?),
            MessageKind::InstallView => Payload::InstallView(bincode::deserialize(bytes)?),
            MessageKind::Application(_) => Payload::Application(bincode::deserialize(bytes)?),
        })
    }

    /// Kind implied by the payload; application payloads need the envelope's
    /// application kind.
    fn protocol_kind(&self) -> Option<MessageKind> {
        Some(match self {
            Payload::Handshake(_) => MessageKind::Handshake,
            Payload::HeartbeatRequest(_) => MessageKind::HeartbeatRequest,
            Payload::HeartbeatResponse(_) => MessageKind::HeartbeatResponse,
            Payload::Suspect(_) => MessageKind::Suspect,
            Payload::FinalCheckRequest(_) => MessageKind::FinalCheckRequest,
            Payload::FinalCheckResponse(_) => MessageKind::FinalCheckResponse,
            Payload::JoinRequest(_) => MessageKind::JoinRequest,
            Payload::JoinResponse(_) => MessageKind::JoinResponse,
            Payload::LeaveRequest(_) => MessageKind::LeaveRequest,
            Payload::RemoveMember(_) => MessageKind::RemoveMember,
            Payload::InstallView(_) => MessageKind::InstallView,
            Payload::Application(_) => return None,
        })
    }

    /// The payload as a peer speaking `version` decodes it.
    pub(crate) fn for_version(&self, version: Version) -> Result<Self, GmsError> {
        if version >= Version::CURRENT {
            return Ok(self.clone());
        }
        Ok(match self {
            Payload::Handshake(p) => Payload::Handshake(HandshakePayload {
                identity: p.identity.for_version(version)?,
            }),
            Payload::HeartbeatRequest(p) => Payload::HeartbeatRequest(HeartbeatRequestPayload {
                request_id: p.request_id,
                target: p.target.for_version(version)?,
            }),
            Payload::Suspect(p) => Payload::Suspect(SuspectPayload {
                suspects: p.suspects.iter()
                    .map(|entry| Ok(SuspectEntry {
                        suspect: entry.suspect.for_version(version)?,
                        reason: entry.reason.clone(),
                    }))
                    .collect::<Result<_, GmsError>>()?,
            }),
            Payload::FinalCheckRequest(p) => Payload::FinalCheckRequest(FinalCheckRequestPayload {
                request_id: p.request_id,
                target: p.target.for_version(version)?,
            }),
            Payload::JoinRequest(p) => Payload::JoinRequest(JoinRequestPayload {
                member: p.member.for_version(version)?,
            }),
            Payload::JoinResponse(JoinResponsePayload::Accepted(view)) => {
                Payload::JoinResponse(JoinResponsePayload::Accepted(view.for_version(version)?))
            }
            Payload::JoinResponse(JoinResponsePayload::Redirect(coordinator)) => {
                Payload::JoinResponse(JoinResponsePayload::Redirect(coordinator.for_version(version)?))
            }
            Payload::LeaveRequest(p) => Payload::LeaveRequest(LeaveRequestPayload {
                member: p.member.for_version(version)?,
                reason: p.reason.clone(),
            }),
            Payload::RemoveMember(p) => Payload::RemoveMember(RemoveMemberPayload {
                member: p.member.for_version(version)?,
                reason: p.reason.clone(),
            }),
            Payload::InstallView(p) => Payload::InstallView(InstallViewPayload {
                view: p.view.for_version(version)?,
            }),
            other => other.clone(),
        })
    }
}

/// [`Message`] typed unit of wire data.
///
/// The `sender` is whatever the receiving side could verify: the handshake
/// identity on a direct channel connection, or the envelope claim checked
/// against the datagram source address. Whatever the remote payload claimed
/// beyond that is discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) sender: Option<MemberIdentifier>,
    pub(crate) recipient: Option<MemberIdentifier>,
    pub(crate) payload: Payload,
}

impl Message {
    /// Message for a protocol payload; the kind follows from the payload.
    pub fn new(payload: Payload) -> Result<Self, GmsError> {
        let kind = payload.protocol_kind()
            .ok_or_else(|| GmsError::Codec("application payloads need an application kind".to_string()))?;
        Ok(Self { kind, sender: None, recipient: None, payload })
    }

    /// Opaque application message of application type `kind`.
    pub fn application(kind: u16, data: impl Into<Vec<u8>>) -> Result<Self, GmsError> {
        Ok(Self {
            kind: MessageKind::application(kind)?,
            sender: None,
            recipient: None,
            payload: Payload::Application(ApplicationPayload { data: data.into() }),
        })
    }

    pub fn with_recipient(mut self, recipient: MemberIdentifier) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub(crate) fn with_sender(mut self, sender: MemberIdentifier) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> Option<&MemberIdentifier> {
        self.sender.as_ref()
    }

    /// Explicit recipient, `None` for messages broadcast to the view.
    pub fn recipient(&self) -> Option<&MemberIdentifier> {
        self.recipient.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Application bytes, for application messages.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Application(p) => Some(&p.data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_payload() {
        let message = Message::new(Payload::HeartbeatResponse(HeartbeatResponsePayload { request_id: 3 })).unwrap();
        assert_eq!(message.kind(), MessageKind::HeartbeatResponse);
        assert!(message.sender().is_none());

        let application = Message::application(9, b"hello".to_vec()).unwrap();
        assert_eq!(application.kind(), MessageKind::Application(9));
        assert_eq!(application.data(), Some(&b"hello"[..]));

        assert!(Message::new(Payload::Application(ApplicationPayload { data: vec![] })).is_err());
    }
}
