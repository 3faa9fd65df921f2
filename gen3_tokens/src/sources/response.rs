use reqwest::{Response, StatusCode, Url};
use thiserror::Error;

use crate::AccessToken;

/// A token endpoint answered with something other than a usable token
///
/// Both the key exchange and the workspace token service report failures
/// through this type, carrying the URL, status, and raw body for diagnosis.
#[derive(Debug, Error)]
#[error("failed to get an access token from {url}: {fault}; body: {body:?}")]
pub struct InvalidTokenResponse {
    url: Url,
    status: Option<StatusCode>,
    body: String,
    #[source]
    fault: ResponseFault,
}

impl InvalidTokenResponse {
    /// The URL that was requested
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The status of the response, if one was received
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The raw body of the response
    pub fn body(&self) -> &str {
        &self.body
    }

    /// What was wrong with the response
    pub fn fault(&self) -> &ResponseFault {
        &self.fault
    }
}

/// The way in which a token response was unusable
#[derive(Debug, Error)]
pub enum ResponseFault {
    /// The request could not be sent
    #[error("request could not be sent")]
    Send(#[source] reqwest::Error),
    /// The status was not `200 OK`
    #[error("unexpected status {0}")]
    Status(StatusCode),
    /// The body could not be read
    #[error("response body could not be read")]
    BodyRead(#[source] reqwest::Error),
    /// The body was not JSON
    #[error("response body is not JSON")]
    NotJson(#[source] serde_json::Error),
    /// The JSON body lacked the expected string field
    #[error("response has no '{0}' field")]
    MissingField(&'static str),
}

pub(crate) fn send_failed(url: Url, error: reqwest::Error) -> InvalidTokenResponse {
    InvalidTokenResponse {
        url,
        status: None,
        body: String::new(),
        fault: ResponseFault::Send(error),
    }
}

struct JsonResponse {
    url: Url,
    status: StatusCode,
    body: String,
    json: serde_json::Value,
}

async fn read_json_response(response: Response) -> Result<JsonResponse, InvalidTokenResponse> {
    let url = response.url().clone();
    let status = response.status();

    let body = match response.text().await {
        Ok(body) => body,
        Err(error) => {
            return Err(InvalidTokenResponse {
                url,
                status: Some(status),
                body: String::new(),
                fault: ResponseFault::BodyRead(error),
            })
        }
    };

    tracing::debug!(
        response.status = status.as_u16(),
        response.len = body.len(),
        "received token service response"
    );

    if status != StatusCode::OK {
        return Err(InvalidTokenResponse {
            url,
            status: Some(status),
            body,
            fault: ResponseFault::Status(status),
        });
    }

    match serde_json::from_str(&body) {
        Ok(json) => Ok(JsonResponse {
            url,
            status,
            body,
            json,
        }),
        Err(error) => Err(InvalidTokenResponse {
            url,
            status: Some(status),
            body,
            fault: ResponseFault::NotJson(error),
        }),
    }
}

/// Reads a JSON body from a response that must have a `200 OK` status
pub(crate) async fn read_json(response: Response) -> Result<serde_json::Value, InvalidTokenResponse> {
    read_json_response(response).await.map(|r| r.json)
}

/// Reads the access token held in `field` of a `200 OK` JSON response
pub(crate) async fn read_token_field(
    response: Response,
    field: &'static str,
) -> Result<AccessToken, InvalidTokenResponse> {
    let response = read_json_response(response).await?;

    match response.json.get(field).and_then(serde_json::Value::as_str) {
        Some(token) => Ok(AccessToken::new(token.to_owned())),
        None => Err(InvalidTokenResponse {
            url: response.url,
            status: Some(response.status),
            body: response.body,
            fault: ResponseFault::MissingField(field),
        }),
    }
}
