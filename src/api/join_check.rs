use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{MeetError, Result};

/// Answer of the "can I join" endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPermit {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn can_join_url(api_base: &str, meeting_id: &str) -> String {
    format!(
        "{}/meetings/{}/can-join",
        api_base.trim_end_matches('/'),
        urlencoding::encode(meeting_id)
    )
}

/// Map the endpoint's answer onto a join decision
pub fn evaluate(status: StatusCode, permit: Option<JoinPermit>) -> Result<JoinPermit> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let reason = permit
            .and_then(|p| p.reason)
            .unwrap_or_else(|| status.to_string());
        return Err(MeetError::JoinDenied(reason));
    }
    if !status.is_success() {
        return Err(MeetError::network(format!("Join check failed: {}", status)));
    }

    let permit = permit.ok_or_else(|| MeetError::network("Join check returned no body"))?;
    if !permit.allowed {
        return Err(MeetError::JoinDenied(
            permit
                .reason
                .unwrap_or_else(|| "not allowed to join this meeting".to_string()),
        ));
    }
    Ok(permit)
}

/// Ask the surrounding application whether this user may enter the meeting
pub async fn check_can_join(api_base: &str, meeting_id: &str, token: Option<&str>) -> Result<JoinPermit> {
    let url = can_join_url(api_base, meeting_id);
    let client = reqwest::Client::new();

    let mut request = client.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    let permit = response.json::<JoinPermit>().await.ok();

    let result = evaluate(status, permit);
    match &result {
        Ok(_) => tracing::info!(meeting_id = %meeting_id, "Join check passed"),
        Err(e) => tracing::warn!(meeting_id = %meeting_id, error = %e, "Join check refused"),
    }
    result
}
