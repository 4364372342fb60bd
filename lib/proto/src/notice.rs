//! Completion notices.
//!
//! The datastream helpers report stream completion to the coordinator
//! with a fixed 17-byte record: one role byte, then the raw stream UUID.

use uuid::Uuid;

use crate::frame::ProtocolError;

pub const NOTICE_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeRole {
	Read,
	Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionNotice {
	pub role: NoticeRole,
	pub uuid: Uuid,
}

impl CompletionNotice {
	pub fn encode(&self) -> [u8; NOTICE_LEN] {
		let mut buf = [0u8; NOTICE_LEN];
		buf[0] = match self.role {
			NoticeRole::Read => 0,
			NoticeRole::Write => 1,
		};
		buf[1..].copy_from_slice(self.uuid.as_bytes());
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
		if buf.len() != NOTICE_LEN {
			return Err(ProtocolError::ShortNotice {
				expected: NOTICE_LEN,
				got: buf.len(),
			});
		}

		let role = match buf[0] {
			0 => NoticeRole::Read,
			1 => NoticeRole::Write,
			other => return Err(ProtocolError::BadNoticeRole(other)),
		};

		// Length is checked above, this cannot fail.
		let uuid = Uuid::from_slice(&buf[1..]).unwrap();

		return Ok(Self { role, uuid });
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn notices_round_trip() {
		let n = CompletionNotice {
			role: NoticeRole::Write,
			uuid: Uuid::new_v4(),
		};
		assert_eq!(CompletionNotice::decode(&n.encode()).unwrap(), n);
	}

	#[test]
	fn short_notice_is_rejected() {
		assert!(matches!(
			CompletionNotice::decode(&[0u8; 5]),
			Err(ProtocolError::ShortNotice { got: 5, .. })
		));
	}

	#[test]
	fn unknown_role_is_rejected() {
		let mut buf = [0u8; NOTICE_LEN];
		buf[0] = 9;
		assert!(matches!(
			CompletionNotice::decode(&buf),
			Err(ProtocolError::BadNoticeRole(9))
		));
	}
}
