//! REST client for the remote chat backend.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::models::{
    ChatCredential, ChatRoom, CreatedRoom, FileUpload, FoundRoom, MessagePage, PresenceStatus,
    ReadReceipt, StatusPayload, UploadedFile, UserType,
};

/// Operations the chat backend exposes over HTTP.
///
/// Every method takes the credential explicitly so a logout can never leak
/// a stale token into a request.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_rooms(&self, credential: &ChatCredential) -> Result<Vec<ChatRoom>>;

    /// `Ok(None)` when the backend has no room for the pair yet.
    async fn find_room(
        &self,
        credential: &ChatCredential,
        request_id: i64,
        counterpart_id: &str,
    ) -> Result<Option<i64>>;

    async fn create_room(
        &self,
        credential: &ChatCredential,
        request_id: i64,
        counterpart_id: &str,
    ) -> Result<CreatedRoom>;

    async fn fetch_messages(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage>;

    async fn upload_file(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        file: FileUpload,
    ) -> Result<UploadedFile>;

    async fn mark_messages_read(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        message_ids: &[i64],
    ) -> Result<ReadReceipt>;

    async fn mark_room_read(&self, credential: &ChatCredential, room_id: i64)
        -> Result<ReadReceipt>;

    async fn get_status(
        &self,
        credential: &ChatCredential,
        user_id: &str,
        user_type: UserType,
    ) -> Result<StatusPayload>;

    async fn set_status(
        &self,
        credential: &ChatCredential,
        status: PresenceStatus,
    ) -> Result<StatusPayload>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
}

impl HttpChatApi {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {e}")))?;
        let mut base_url = Url::parse(&config.api_base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(HttpChatApi { http, base_url })
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn authorized(builder: RequestBuilder, credential: &ChatCredential) -> Result<RequestBuilder> {
        if !credential.authenticated {
            return Err(ChatError::AuthenticationRequired);
        }
        Ok(builder.bearer_auth(&credential.token))
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            warn!("Chat API request failed: {}", e);
            ChatError::from(e)
        })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChatError::AuthenticationRequired);
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Chat API returned {}: {}", status, body);
            return Err(ChatError::Network(format!("HTTP {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ChatError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_rooms(&self, credential: &ChatCredential) -> Result<Vec<ChatRoom>> {
        let url = self.endpoint(
            "chat/list",
            &[
                ("userId", credential.user_id.clone()),
                ("userType", credential.user_type.to_string()),
            ],
        )?;
        let response = Self::send(Self::authorized(self.http.get(url), credential)?).await?;
        Self::decode(response).await
    }

    async fn find_room(
        &self,
        credential: &ChatCredential,
        request_id: i64,
        counterpart_id: &str,
    ) -> Result<Option<i64>> {
        let url = self.endpoint(
            &format!("chat/room/{request_id}"),
            &[
                ("userId", counterpart_id.to_string()),
                ("userType", credential.user_type.to_string()),
            ],
        )?;
        let response = Self::send(Self::authorized(self.http.get(url), credential)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No room yet for request {} and {}", request_id, counterpart_id);
            return Ok(None);
        }
        let found: Option<FoundRoom> = Self::decode(response).await?;
        Ok(found.map(|room| room.room_id))
    }

    async fn create_room(
        &self,
        credential: &ChatCredential,
        request_id: i64,
        counterpart_id: &str,
    ) -> Result<CreatedRoom> {
        let url = self.endpoint("chat/room", &[])?;
        let body = json!({
            "requestId": request_id,
            "customerId": credential.user_id,
            "userId": counterpart_id,
        });
        let builder = self.http.post(url).json(&body);
        let response = Self::send(Self::authorized(builder, credential)?).await?;
        Self::decode(response).await
    }

    async fn fetch_messages(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage> {
        let url = self.endpoint(
            &format!("chat/room/{room_id}/messages"),
            &[("page", page.to_string()), ("limit", limit.to_string())],
        )?;
        let response = Self::send(Self::authorized(self.http.get(url), credential)?).await?;
        Self::decode(response).await
    }

    async fn upload_file(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        file: FileUpload,
    ) -> Result<UploadedFile> {
        let url = self.endpoint("chat/upload", &[])?;
        let part = multipart::Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime_type)
            .map_err(|e| ChatError::Upload(e.to_string()))?;
        let form = multipart::Form::new()
            .text("roomId", room_id.to_string())
            .part("file", part);
        let builder = self.http.post(url).multipart(form);
        let response = Self::send(Self::authorized(builder, credential)?)
            .await
            .map_err(|e| match e {
                ChatError::Network(reason) => ChatError::Upload(reason),
                other => other,
            })?;
        Self::decode(response).await.map_err(|e| match e {
            ChatError::Network(reason) | ChatError::InvalidResponse(reason) => {
                ChatError::Upload(reason)
            }
            other => other,
        })
    }

    async fn mark_messages_read(
        &self,
        credential: &ChatCredential,
        room_id: i64,
        message_ids: &[i64],
    ) -> Result<ReadReceipt> {
        let url = self.endpoint("chat/messages/read", &[])?;
        let body = json!({ "roomId": room_id, "messageIds": message_ids });
        let builder = self.http.post(url).json(&body);
        let response = Self::send(Self::authorized(builder, credential)?).await?;
        Self::decode(response).await
    }

    async fn mark_room_read(
        &self,
        credential: &ChatCredential,
        room_id: i64,
    ) -> Result<ReadReceipt> {
        let url = self.endpoint(&format!("chat/room/{room_id}/read"), &[])?;
        let response = Self::send(Self::authorized(self.http.post(url), credential)?).await?;
        Self::decode(response).await
    }

    async fn get_status(
        &self,
        credential: &ChatCredential,
        user_id: &str,
        user_type: UserType,
    ) -> Result<StatusPayload> {
        let url = self.endpoint(
            "user/status",
            &[
                ("userId", user_id.to_string()),
                ("userType", user_type.to_string()),
            ],
        )?;
        let response = Self::send(Self::authorized(self.http.get(url), credential)?).await?;
        Self::decode(response).await
    }

    async fn set_status(
        &self,
        credential: &ChatCredential,
        status: PresenceStatus,
    ) -> Result<StatusPayload> {
        let url = self.endpoint("user/status", &[])?;
        let body = json!({
            "userId": credential.user_id,
            "userType": credential.user_type,
            "status": status,
        });
        let builder = self.http.put(url).json(&body);
        let response = Self::send(Self::authorized(builder, credential)?).await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> ChatCredential {
        ChatCredential {
            token: "tok".into(),
            user_id: "customer_1".into(),
            user_type: UserType::Web,
            authenticated: true,
        }
    }

    fn api_for(server: &MockServer) -> HttpChatApi {
        let config = ChatConfig {
            api_base_url: format!("{}/api", server.uri()),
            request_timeout_ms: 500,
            ..ChatConfig::default()
        };
        HttpChatApi::new(&config).unwrap()
    }

    #[tokio::test]
    async fn find_room_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/room/100"))
            .and(query_param("userId", "expert_7"))
            .and(query_param("userType", "WEB"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let found = api_for(&server)
            .find_room(&credential(), 100, "expert_7")
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn find_room_server_error_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/room/100"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = api_for(&server)
            .find_room(&credential(), 100, "expert_7")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(std::time::Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = api_for(&server).list_rooms(&credential()).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[tokio::test]
    async fn create_room_posts_pair_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/room"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({
                "requestId": 100,
                "customerId": "customer_1",
                "userId": "expert_7"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"roomId": 55, "isNew": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let created = api_for(&server)
            .create_room(&credential(), 100, "expert_7")
            .await
            .unwrap();
        assert_eq!(created, CreatedRoom { room_id: 55, is_new: true });
    }

    #[tokio::test]
    async fn unauthorized_maps_to_authentication_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/list"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = api_for(&server).list_rooms(&credential()).await.unwrap_err();
        assert_eq!(err, ChatError::AuthenticationRequired);
    }

    #[tokio::test]
    async fn unauthenticated_credential_never_hits_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let err = api_for(&server)
            .list_rooms(&ChatCredential::unauthenticated())
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::AuthenticationRequired);
    }

    #[tokio::test]
    async fn fetch_messages_sends_page_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/room/55/messages"))
            .and(query_param("page", "2"))
            .and(query_param("limit", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{
                    "messageId": 1,
                    "senderType": "APP",
                    "senderId": "expert_7",
                    "text": "hello",
                    "isRead": true,
                    "createdAt": "2024-03-01T10:00:00Z"
                }],
                "page": 2,
                "limit": 20,
                "total": 21,
                "isLastPage": true
            })))
            .mount(&server)
            .await;

        let page = api_for(&server)
            .fetch_messages(&credential(), 55, 2, 20)
            .await
            .unwrap();
        assert!(page.is_last_page);
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn upload_failure_is_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/upload"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;

        let file = FileUpload {
            file_name: "wall.jpg".into(),
            mime_type: "image/jpeg".into(),
            bytes: vec![0xff, 0xd8],
        };
        let err = api_for(&server)
            .upload_file(&credential(), 55, file)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Upload(_)));
    }
}
