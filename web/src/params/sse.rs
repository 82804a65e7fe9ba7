use serde::Deserialize;
use ::sse::ConnectionId;
use utoipa::IntoParams;

const MAX_CLIENT_ID_LEN: usize = 128;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamParams {
    /// Identifier a reconnecting client wants to keep. Advisory only: anything
    /// other than 1-128 characters of `[A-Za-z0-9_-]` is replaced by a new id.
    pub client_id: Option<String>,
}

impl StreamParams {
    pub fn connection_id(&self) -> ConnectionId {
        match self.client_id.as_deref() {
            Some(client_id) if is_valid_client_id(client_id) => ConnectionId::from(client_id),
            _ => ConnectionId::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsParams {
    /// Restrict the stats to a single chat.
    pub chat_id: Option<String>,
}

fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= MAX_CLIENT_ID_LEN
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
