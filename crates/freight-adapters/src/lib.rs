//! Remote catalog client + session authenticator contracts, and the
//! seller-backend implementation behind them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use freight_core::{ListingRecord, ProfileCatalog};
use freight_storage::{build_session_client, HttpClientConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "freight-adapters";

pub const DEFAULT_LOGIN_URL: &str = "https://login.kongfz.com/Pc/Login/account";
pub const DEFAULT_API_BASE: &str =
    "https://seller.kongfz.com/pc-gw/book-manage-service/client/pc/goods";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";
pub const DEFAULT_SESSION_COOKIE: &str = "PHPSESSID";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Service(String),
    #[error("unexpected payload: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("login transport failure: {0}")]
    Transport(String),
}

/// One page of listings for a price range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingsPage {
    pub items: Vec<ListingRecord>,
    pub current_page: u32,
    pub total_pages: u32,
}

/// Per-id outcome of a bulk profile change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkChangeOutcome {
    pub success_ids: Vec<String>,
    pub fail_ids: Vec<String>,
    pub message: Option<String>,
}

impl BulkChangeOutcome {
    /// Explicit success ids win, then explicit fail ids; with neither list
    /// populated every submitted id counts as accepted.
    pub fn succeeded(&self, item_id: &str) -> bool {
        let item_id = item_id.trim();
        if !self.success_ids.is_empty() {
            self.success_ids.iter().any(|id| id == item_id)
        } else if !self.fail_ids.is_empty() {
            !self.fail_ids.iter().any(|id| id == item_id)
        } else {
            true
        }
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_profile_catalog(&self) -> Result<ProfileCatalog, RemoteError>;

    async fn fetch_listings_page(
        &self,
        price_min: &str,
        price_max: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ListingsPage, RemoteError>;

    async fn submit_bulk_profile_change(
        &self,
        item_ids: &[i64],
        profile_id: &str,
        unit_weight: &str,
    ) -> Result<BulkChangeOutcome, RemoteError>;
}

#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Exchange credentials for a client bound to a fresh session.
    async fn login(&self, username: &str, password: &str)
        -> Result<Arc<dyn CatalogClient>, AuthError>;
}

/// Uniform `{status, errCode, errMessage, result}` envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub status: bool,
    #[serde(rename = "errCode", default)]
    pub err_code: Option<JsonValue>,
    #[serde(rename = "errMessage", default)]
    pub err_message: Option<String>,
    pub result: Option<T>,
}

impl<T: Default> ApiEnvelope<T> {
    pub fn into_result(self) -> Result<T, RemoteError> {
        let code_is_zero = match &self.err_code {
            Some(JsonValue::Number(n)) => n.as_i64() == Some(0),
            Some(JsonValue::String(s)) => s.trim() == "0",
            _ => false,
        };
        if self.status && code_is_zero {
            Ok(self.result.unwrap_or_default())
        } else {
            Err(RemoteError::Service(
                self.err_message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "Unknown Error".to_string()),
            ))
        }
    }
}

fn scalar_to_string(value: JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<JsonValue>::deserialize(deserializer)?
        .map(scalar_to_string)
        .unwrap_or_default())
}

fn lenient_id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<JsonValue>>::deserialize(deserializer)?
        .unwrap_or_default()
        .into_iter()
        .map(scalar_to_string)
        .collect())
}

#[derive(Debug, Default, Deserialize)]
struct BaseSelectData {
    #[serde(rename = "mouldList", default)]
    mould_list: Vec<WireProfile>,
}

#[derive(Debug, Deserialize)]
struct WireProfile {
    #[serde(rename = "mouldName", deserialize_with = "lenient_string", default)]
    name: String,
    #[serde(rename = "mouldId", deserialize_with = "lenient_string", default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct UnsoldListResult {
    #[serde(rename = "productInfoPageResult", default)]
    page: WirePage,
}

#[derive(Debug, Default, Deserialize)]
struct WirePage {
    #[serde(default)]
    list: Vec<WireListing>,
    #[serde(default)]
    pager: WirePager,
}

#[derive(Debug, Default, Deserialize)]
struct WirePager {
    #[serde(default)]
    pages: u32,
    #[serde(rename = "currentPage", default)]
    current_page: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireListing {
    #[serde(default, deserialize_with = "lenient_string")]
    item_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    item_sn: String,
    #[serde(default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    quality_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    quality: String,
    #[serde(default, deserialize_with = "lenient_string")]
    price: String,
    #[serde(default, deserialize_with = "lenient_string")]
    real_price: String,
    #[serde(default, deserialize_with = "lenient_string")]
    mould_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    mould_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    weight: String,
}

impl From<WireListing> for ListingRecord {
    fn from(wire: WireListing) -> Self {
        Self {
            item_id: wire.item_id,
            item_sn: wire.item_sn,
            name: wire.name,
            quality_name: wire.quality_name,
            quality: wire.quality,
            price: wire.price,
            real_price: wire.real_price,
            profile_id: wire.mould_id,
            profile_name: wire.mould_name,
            weight: wire.weight,
            result: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireBulkResult {
    #[serde(rename = "successIds", default, deserialize_with = "lenient_id_list")]
    success_ids: Vec<String>,
    #[serde(rename = "failIds", default, deserialize_with = "lenient_id_list")]
    fail_ids: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginReply {
    #[serde(rename = "errCode", default)]
    err_code: Option<JsonValue>,
    #[serde(rename = "errInfo", default)]
    err_info: Option<String>,
}

fn is_falsy(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::Bool(b)) => !b,
        Some(JsonValue::Number(n)) => n.as_f64() == Some(0.0),
        Some(JsonValue::String(s)) => s.is_empty() || s == "0",
        Some(_) => false,
    }
}

async fn decode_envelope<T: DeserializeOwned + Default>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        return Err(RemoteError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }
    let bytes = response.bytes().await?;
    let envelope: ApiEnvelope<T> =
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))?;
    envelope.into_result()
}

/// Where the seller backend lives and how to talk to it.
#[derive(Debug, Clone)]
pub struct KfzSettings {
    pub login_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub session_cookie: String,
}

impl Default for KfzSettings {
    fn default() -> Self {
        Self {
            login_url: DEFAULT_LOGIN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }
}

impl KfzSettings {
    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.read_timeout,
            user_agent: Some(self.user_agent.clone()),
            accept_language: Some("zh-CN,zh;q=0.9,en;q=0.8".to_string()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone)]
pub struct KfzAuthenticator {
    settings: KfzSettings,
}

impl KfzAuthenticator {
    pub fn new(settings: KfzSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionAuthenticator for KfzAuthenticator {
    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn CatalogClient>, AuthError> {
        // A new client carries a new, empty cookie store.
        let http = build_session_client(&self.settings.http_config())
            .map_err(|e| AuthError::Transport(format!("{e:#}")))?;

        let form = [
            ("loginName", username),
            ("loginPass", password),
            ("returnUrl", "https://www.kongfz.com/"),
            ("autoLogin", "0"),
        ];
        info!(username, "logging in");
        let response = http
            .post(&self.settings.login_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(format!("HTTP Error: {}", status.as_u16())));
        }

        let cookie_prefix = format!("{}=", self.settings.session_cookie);
        let fresh_session = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(&cookie_prefix));

        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let reply: LoginReply = serde_json::from_slice(&body).unwrap_or_default();

        if fresh_session && is_falsy(reply.err_code.as_ref()) {
            info!(username, "login succeeded");
            return Ok(Arc::new(KfzCatalogClient {
                http,
                settings: self.settings.clone(),
            }));
        }

        let info = reply.err_info.unwrap_or_else(|| "unknown error".to_string());
        let message = match reply.err_code {
            Some(code) if !is_falsy(Some(&code)) => format!("{}: {info}", scalar_to_string(code)),
            _ => info,
        };
        Err(AuthError::Rejected(message))
    }
}

/// Catalog client bound to one authenticated session.
#[derive(Debug, Clone)]
pub struct KfzCatalogClient {
    http: reqwest::Client,
    settings: KfzSettings,
}

#[async_trait]
impl CatalogClient for KfzCatalogClient {
    async fn fetch_profile_catalog(&self) -> Result<ProfileCatalog, RemoteError> {
        let url = self.settings.endpoint("getBaseSelectData");
        let response = self.http.get(&url).send().await?;
        let data: BaseSelectData = decode_envelope(response).await?;
        debug!(profiles = data.mould_list.len(), "profile catalog fetched");
        Ok(ProfileCatalog::from_pairs(
            data.mould_list.into_iter().map(|p| (p.name, p.id)),
        ))
    }

    async fn fetch_listings_page(
        &self,
        price_min: &str,
        price_max: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ListingsPage, RemoteError> {
        let url = self.settings.endpoint("unSold/list");
        let body = json!({
            "requestType": "onSale",
            "name": "",
            "author": "",
            "press": "",
            "myCatId": "",
            "catId": "",
            "priceMin": price_min,
            "priceMax": price_max,
            "startCreateTime": "",
            "endCreateTime": "",
            "itemSn": "",
            "shippingMould": "",
            "quality": "",
            "isbn": "",
            "certifyStatus": "",
            "deliverTimeParams": "",
            "isDiscount": false,
            "isSoldOut": false,
            "noItemSn": false,
            "noPic": false,
            "noStock": false,
            "soldTimeBegin": "",
            "soldTimeEnd": "",
            "startUpdateTime": "",
            "endUpdateTime": "",
            "sortField": "",
            "sortOrder": "",
            "isItemSnEqual": 0,
            "page": page,
            "size": page_size,
        });
        let span = info_span!("listings_page", price_min, price_max, page);
        async move {
            let response = self.http.post(&url).json(&body).send().await?;
            let data: UnsoldListResult = decode_envelope(response).await?;
            Ok::<_, RemoteError>(ListingsPage {
                current_page: data.page.pager.current_page.unwrap_or(page),
                total_pages: data.page.pager.pages,
                items: data.page.list.into_iter().map(ListingRecord::from).collect(),
            })
        }
        .instrument(span)
        .await
    }

    async fn submit_bulk_profile_change(
        &self,
        item_ids: &[i64],
        profile_id: &str,
        unit_weight: &str,
    ) -> Result<BulkChangeOutcome, RemoteError> {
        let url = self.settings.endpoint("batchUpdate");
        let body = json!({
            "updateType": "mouldId",
            "itemIds": item_ids,
            "value": profile_id,
            "itemUnit": unit_weight,
            "modifyType": "all",
        });
        info!(items = item_ids.len(), profile_id, "submitting bulk profile change");
        let response = self
            .http
            .post(&url)
            .timeout(self.settings.write_timeout)
            .json(&body)
            .send()
            .await?;
        let data: WireBulkResult = decode_envelope(response).await?;
        Ok(BulkChangeOutcome {
            success_ids: data.success_ids,
            fail_ids: data.fail_ids,
            message: data.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_requires_status_and_zero_code() {
        let ok: ApiEnvelope<BaseSelectData> = serde_json::from_str(
            r#"{"status":true,"errCode":0,"result":{"mouldList":[{"mouldName":"A","mouldId":943965}]}}"#,
        )
        .unwrap();
        let data = ok.into_result().unwrap();
        assert_eq!(data.mould_list[0].id, "943965");

        let failed: ApiEnvelope<BaseSelectData> =
            serde_json::from_str(r#"{"status":false,"errCode":1001,"errMessage":"会话过期"}"#).unwrap();
        match failed.into_result() {
            Err(RemoteError::Service(message)) => assert_eq!(message, "会话过期"),
            other => panic!("unexpected: {other:?}"),
        }

        let no_code: ApiEnvelope<BaseSelectData> =
            serde_json::from_str(r#"{"status":true,"result":{}}"#).unwrap();
        match no_code.into_result() {
            Err(RemoteError::Service(message)) => assert_eq!(message, "Unknown Error"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn null_result_decodes_to_default() {
        let envelope: ApiEnvelope<UnsoldListResult> =
            serde_json::from_str(r#"{"status":true,"errCode":0,"result":null}"#).unwrap();
        let data = envelope.into_result().unwrap();
        assert!(data.page.list.is_empty());
        assert_eq!(data.page.pager.pages, 0);
    }

    #[test]
    fn wire_listing_accepts_numbers_and_nulls() {
        let wire: WireListing = serde_json::from_str(
            r#"{"itemId":8873035567,"itemSn":null,"name":"Dream","price":"12.50","realPrice":11.5,"quality":85,"mouldId":943965,"extra":"ignored"}"#,
        )
        .unwrap();
        let record = ListingRecord::from(wire);
        assert_eq!(record.item_id, "8873035567");
        assert_eq!(record.item_sn, "");
        assert_eq!(record.price, "12.50");
        assert_eq!(record.real_price, "11.5");
        assert_eq!(record.quality, "85");
        assert_eq!(record.profile_id, "943965");
        assert_eq!(record.weight, "");
        assert!(record.result.is_empty());
    }

    #[test]
    fn bulk_outcome_prefers_explicit_ids() {
        let explicit = BulkChangeOutcome {
            success_ids: vec!["1".into()],
            fail_ids: vec!["2".into()],
            message: None,
        };
        assert!(explicit.succeeded("1"));
        assert!(!explicit.succeeded("2"));
        assert!(!explicit.succeeded("3"));

        let only_failures = BulkChangeOutcome {
            fail_ids: vec!["2".into()],
            ..Default::default()
        };
        assert!(only_failures.succeeded("1"));
        assert!(!only_failures.succeeded("2"));

        let silent = BulkChangeOutcome::default();
        assert!(silent.succeeded("1"));
        assert!(silent.succeeded("99"));
    }

    #[test]
    fn login_error_codes_are_falsy_only_when_empty_or_zero() {
        assert!(is_falsy(None));
        assert!(is_falsy(Some(&json!(0))));
        assert!(is_falsy(Some(&json!(""))));
        assert!(!is_falsy(Some(&json!(1001))));
        assert!(!is_falsy(Some(&json!("E42"))));
    }
}
