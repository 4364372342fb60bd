use async_trait::async_trait;
use reqwest::StatusCode;
use std::error::Error;
use thiserror::Error;
use uuid::Uuid;

//
// MARK: errors
//

#[derive(Debug, Error)]
pub enum DiscoveryRequestError {
	#[error("discovery returned error code {code}: {message:?}")]
	GenericHttp {
		code: StatusCode,
		message: Option<String>,
	},

	#[error("discovery request failed")]
	Other {
		#[source]
		error: Box<dyn Error + Sync + Send + 'static>,
	},

	/// Discovery returned an index past the end of the uuid list we sent
	#[error("discovery returned out-of-range index {index} for {len} uuids")]
	BadIndex { index: usize, len: usize },
}

//
// MARK: client
//

/// The persistence-discovery service.
///
/// After a crash on `addr`, the coordinator asks which of the streams it
/// is about to re-execute were already committed somewhere that
/// survived; those producers need not run again.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
	/// Returns indexes into `uuids` whose streams are already persisted
	/// off of `addr`.
	async fn find_persisted_optimized(
		&self,
		uuids: &[Uuid],
		addr: &str,
	) -> Result<Vec<usize>, DiscoveryRequestError>;
}
