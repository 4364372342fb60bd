use async_trait::async_trait;
use reqwest::{Client, IntoUrl, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{DiscoveryClient, DiscoveryRequestError};

pub struct ReqwestDiscoveryClient {
	client: Client,
	discovery_url: Url,
}

impl ReqwestDiscoveryClient {
	pub fn new(discovery_url: impl IntoUrl) -> Result<Self, reqwest::Error> {
		Ok(Self {
			client: Client::new(),
			discovery_url: discovery_url.into_url()?,
		})
	}
}

fn convert_error(e: reqwest::Error) -> DiscoveryRequestError {
	if let Some(status) = e.status() {
		DiscoveryRequestError::GenericHttp {
			code: status,
			message: Some(e.to_string()),
		}
	} else {
		DiscoveryRequestError::Other { error: Box::new(e) }
	}
}

#[derive(Debug, Deserialize)]
struct FindPersistedResponse {
	#[serde(default)]
	indexes: Vec<usize>,
}

#[async_trait]
impl DiscoveryClient for ReqwestDiscoveryClient {
	async fn find_persisted_optimized(
		&self,
		uuids: &[Uuid],
		addr: &str,
	) -> Result<Vec<usize>, DiscoveryRequestError> {
		let uuid_strings: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();

		let res = self
			.client
			.post(self.discovery_url.join("/find_persisted_optimized").unwrap())
			.json(&json!({
				"uuids": uuid_strings,
				"addr": addr,
			}))
			.send()
			.await
			.map_err(convert_error)?;

		match res.status() {
			StatusCode::OK => {
				let body: FindPersistedResponse = res.json().await.map_err(convert_error)?;

				for index in &body.indexes {
					if *index >= uuids.len() {
						return Err(DiscoveryRequestError::BadIndex {
							index: *index,
							len: uuids.len(),
						});
					}
				}
				return Ok(body.indexes);
			}

			x => {
				return Err(DiscoveryRequestError::GenericHttp {
					code: x,
					message: res.text().await.ok(),
				})
			}
		}
	}
}
