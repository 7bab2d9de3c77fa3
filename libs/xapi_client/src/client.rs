use reqwest::Url;
use tracing::debug;

use crate::error::XApiError;
use crate::rpc::{self, RpcValue};
use crate::types::OpaqueRef;

const AUTH_FAILED: &str = "SESSION_AUTHENTICATION_FAILED";

/// An authenticated XML-RPC session against a pool master.
///
/// TLS certificate verification is disabled on purpose: pool masters live
/// on internal addresses with self-signed certificates. This is an
/// explicit property of the constructor, not a hidden default.
#[derive(Debug)]
pub struct XApiSession {
    client: reqwest::Client,
    master_url: Url,
    session_ref: OpaqueRef,
}

impl XApiSession {
    /// Open a session via `session.login_with_password`. `master` may be a
    /// bare host name or a full `https://` URL.
    pub async fn login(
        master: &str,
        username: &str,
        password: &str,
    ) -> Result<XApiSession, XApiError> {
        let master_url = if master.starts_with("http://") || master.starts_with("https://") {
            master.to_string()
        } else {
            format!("https://{}", master)
        };
        let master_url =
            Url::parse(&master_url).map_err(|e| XApiError::Transport(e.to_string()))?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        debug!("Logging in to pool master {}", master_url);
        let session_ref = dispatch(
            &client,
            &master_url,
            "session.login_with_password",
            vec![
                RpcValue::string(username),
                RpcValue::string(password),
                RpcValue::string("1.0"),
                RpcValue::string("xenvault"),
            ],
        )
        .await
        .map_err(|e| match e {
            XApiError::Failure { code, details } if code == AUTH_FAILED => {
                XApiError::Auth(details.join("; "))
            }
            other => other,
        })?;

        let session_ref = session_ref
            .as_str()
            .map(OpaqueRef::from)
            .ok_or_else(|| XApiError::Transport("login returned a non-string session".into()))?;

        Ok(XApiSession {
            client,
            master_url,
            session_ref,
        })
    }

    pub async fn logout(&self) -> Result<(), XApiError> {
        self.call("session.logout", vec![]).await.map(|_| ())
    }

    /// Invoke `class.method`, prepending the session reference.
    pub async fn call(
        &self,
        method: &str,
        mut params: Vec<RpcValue>,
    ) -> Result<RpcValue, XApiError> {
        params.insert(0, RpcValue::string(self.session_ref.as_str()));
        dispatch(&self.client, &self.master_url, method, params).await
    }

    pub fn master_url(&self) -> &Url {
        &self.master_url
    }

    /// The raw session id, required as a query parameter by the bulk
    /// import/export endpoints.
    pub fn session_id(&self) -> &OpaqueRef {
        &self.session_ref
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }
}

async fn dispatch(
    client: &reqwest::Client,
    master_url: &Url,
    method: &str,
    params: Vec<RpcValue>,
) -> Result<RpcValue, XApiError> {
    let body = rpc::encode_call(method, &params).map_err(XApiError::from)?;

    let response = client
        .post(master_url.clone())
        .header(reqwest::header::CONTENT_TYPE, "text/xml")
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(XApiError::Transport(format!(
            "{} returned http status {}",
            method, status
        )));
    }

    let text = response.text().await?;
    let value = rpc::parse_response(&text).map_err(XApiError::from)?;
    unwrap_envelope(method, value)
}

/// XenAPI wraps every result in `{Status, Value | ErrorDescription}`.
fn unwrap_envelope(method: &str, value: RpcValue) -> Result<RpcValue, XApiError> {
    let mut members = value.into_struct().ok_or_else(|| {
        XApiError::Transport(format!("{} returned no result envelope", method))
    })?;

    match members.get("Status").and_then(RpcValue::as_str) {
        Some("Success") => members
            .remove("Value")
            .ok_or_else(|| XApiError::Transport(format!("{} succeeded without a value", method))),
        Some("Failure") => {
            let mut details: Vec<String> = members
                .remove("ErrorDescription")
                .and_then(RpcValue::into_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let code = if details.is_empty() {
                "UNKNOWN_ERROR".to_string()
            } else {
                details.remove(0)
            };
            Err(XApiError::Failure { code, details })
        }
        _ => Err(XApiError::Transport(format!(
            "{} returned an unrecognised status",
            method
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope(status: &str, extra: Vec<(&str, RpcValue)>) -> RpcValue {
        let mut members = BTreeMap::new();
        members.insert("Status".to_string(), RpcValue::string(status));
        for (k, v) in extra {
            members.insert(k.to_string(), v);
        }
        RpcValue::Struct(members)
    }

    #[test]
    fn unwraps_success() {
        let value = envelope("Success", vec![("Value", RpcValue::string("OpaqueRef:9"))]);
        let unwrapped = unwrap_envelope("VM.get_by_uuid", value).unwrap();
        assert_eq!(unwrapped.as_str(), Some("OpaqueRef:9"));
    }

    #[test]
    fn maps_failure_to_code_and_details() {
        let value = envelope(
            "Failure",
            vec![(
                "ErrorDescription",
                RpcValue::Array(vec![
                    RpcValue::string("SR_FULL"),
                    RpcValue::string("requested"),
                    RpcValue::string("maximum"),
                ]),
            )],
        );
        match unwrap_envelope("VDI.create", value) {
            Err(XApiError::Failure { code, details }) => {
                assert_eq!(code, "SR_FULL");
                assert_eq!(details, vec!["requested", "maximum"]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn missing_envelope_is_a_transport_error() {
        match unwrap_envelope("VM.get_record", RpcValue::string("bare")) {
            Err(XApiError::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
