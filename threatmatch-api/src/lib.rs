//! Network boundary for threat list matching
//!
//! This crate defines the typed Fetch (threat list update) and Find (full
//! hash) requests and responses, the [`ThreatService`] trait the matcher
//! talks to, and [`HttpThreatService`], a JSON-over-HTTP implementation
//! for Safe Browsing v4 compatible servers.

use async_trait::async_trait;
use reqwest::{Client, Proxy, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use threatmatch_hash::rice::{decode_rice_hashes, decode_rice_integers};
use threatmatch_hash::{HashError, HashPrefix, MAX_HASH_PREFIX_LENGTH, MIN_HASH_PREFIX_LENGTH};
use tracing::{debug, error};

pub mod serde_helpers;

/// Default API base URL
pub const API_BASE_URL: &str = "https://safebrowsing.googleapis.com";

const THREAT_LIST_UPDATES_PATH: &str = "/v4/threatListUpdates:fetch";
const FULL_HASHES_PATH: &str = "/v4/fullHashes:find";

/// Error types reported by the remote service
#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad request error (HTTP 400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication error (HTTP 401)
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// API quota exceeded (HTTP 403)
    #[error("API quota exceeded")]
    QuotaExceeded,

    /// Rate limiting error (HTTP 429)
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    /// Server unavailable (HTTP 503)
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// Other HTTP error
    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },
}

impl ApiError {
    /// Map a non-success HTTP status to an API error
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            400 => ApiError::BadRequest(body),
            401 => ApiError::Authentication("Invalid API key".to_string()),
            403 => ApiError::QuotaExceeded,
            429 => ApiError::RateLimit { retry_after },
            503 => ApiError::ServerUnavailable("Service temporarily unavailable".to_string()),
            _ => ApiError::HttpStatus {
                status,
                message: body,
            },
        }
    }
}

/// Error type for network operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error reported by the remote service
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Response body could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failure from a non-HTTP service implementation
    #[error("Service error: {0}")]
    Service(String),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! protocol_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(#[$unspecified_meta:meta])*
            $unspecified:ident => $unspecified_str:literal,
            $($(#[$variant_meta:meta])* $variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[$unspecified_meta])*
            #[serde(rename = $unspecified_str)]
            $unspecified,
            $(
                $(#[$variant_meta])*
                #[serde(rename = $str)]
                $variant,
            )*
        }

        impl $name {
            /// Protocol name of this value
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::$unspecified => $unspecified_str,
                    $(Self::$variant => $str,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $unspecified_str => Ok(Self::$unspecified),
                    $($str => Ok(Self::$variant),)*
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

protocol_enum! {
    /// Types of threats
    pub enum ThreatType {
        Unspecified => "THREAT_TYPE_UNSPECIFIED",
        Malware => "MALWARE",
        SocialEngineering => "SOCIAL_ENGINEERING",
        UnwantedSoftware => "UNWANTED_SOFTWARE",
        PotentiallyHarmfulApplication => "POTENTIALLY_HARMFUL_APPLICATION",
    }
}

impl ThreatType {
    /// Every threat type that has a list of its own
    pub const LISTED: [ThreatType; 4] = [
        ThreatType::Malware,
        ThreatType::SocialEngineering,
        ThreatType::UnwantedSoftware,
        ThreatType::PotentiallyHarmfulApplication,
    ];
}

protocol_enum! {
    /// Platform types
    pub enum PlatformType {
        Unspecified => "PLATFORM_TYPE_UNSPECIFIED",
        Windows => "WINDOWS",
        Linux => "LINUX",
        Android => "ANDROID",
        Osx => "OSX",
        Ios => "IOS",
        AnyPlatform => "ANY_PLATFORM",
        AllPlatforms => "ALL_PLATFORMS",
        Chrome => "CHROME",
    }
}

protocol_enum! {
    /// Types of threat entries
    pub enum ThreatEntryType {
        Unspecified => "THREAT_ENTRY_TYPE_UNSPECIFIED",
        Url => "URL",
        Executable => "EXECUTABLE",
        IpRange => "IP_RANGE",
    }
}

protocol_enum! {
    /// Encodings a threat entry set can use
    #[derive(Default)]
    pub enum CompressionType {
        Unspecified => "COMPRESSION_TYPE_UNSPECIFIED",
        #[default]
        Raw => "RAW",
        Rice => "RICE",
    }
}

protocol_enum! {
    /// Whether a list update is a delta or a replacement
    #[derive(Default)]
    pub enum ResponseType {
        #[default]
        Unspecified => "RESPONSE_TYPE_UNSPECIFIED",
        PartialUpdate => "PARTIAL_UPDATE",
        FullUpdate => "FULL_UPDATE",
    }
}

/// A threat descriptor describes a specific threat list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreatDescriptor {
    /// The type of threat (malware, phishing, etc)
    pub threat_type: ThreatType,

    /// The platform this threat applies to
    pub platform_type: PlatformType,

    /// The type of entries in the threat list
    pub threat_entry_type: ThreatEntryType,
}

impl ThreatDescriptor {
    /// URL list for `threat_type` on any platform
    pub fn url_list(threat_type: ThreatType) -> Self {
        Self {
            threat_type,
            platform_type: PlatformType::AnyPlatform,
            threat_entry_type: ThreatEntryType::Url,
        }
    }
}

impl fmt::Display for ThreatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.threat_type, self.platform_type, self.threat_entry_type
        )
    }
}

/// Identifies the client to the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub client_version: String,
}

/// Limits and capabilities sent along with a list update request.
///
/// These are forwarded to the server as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub max_update_entries: i32,
    pub max_database_entries: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub supported_compressions: Vec<CompressionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_location: Option<String>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_update_entries: 2048,
            max_database_entries: 250_000,
            region: None,
            supported_compressions: vec![CompressionType::Raw, CompressionType::Rice],
            language: None,
            device_location: None,
        }
    }
}

/// Update request for one list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUpdateRequest {
    pub threat_type: ThreatType,
    pub platform_type: PlatformType,
    pub threat_entry_type: ThreatEntryType,
    /// Version token of the local copy, empty when the list was never fetched
    #[serde(default, with = "serde_helpers::base64_bytes")]
    pub state: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

/// Fetch RPC request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub client: ClientInfo,
    pub list_update_requests: Vec<ListUpdateRequest>,
}

/// Uncompressed prefixes, all `prefix_size` bytes long, concatenated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHashes {
    pub prefix_size: i32,
    #[serde(default, with = "serde_helpers::base64_bytes")]
    pub raw_hashes: Vec<u8>,
}

/// Uncompressed removal indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIndices {
    #[serde(default)]
    pub indices: Vec<i32>,
}

/// Golomb-Rice delta encoded 32-bit integers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiceDeltaEncoding {
    #[serde(default, with = "serde_helpers::int64")]
    pub first_value: i64,
    #[serde(default)]
    pub rice_parameter: i32,
    #[serde(default)]
    pub num_entries: i32,
    #[serde(default, with = "serde_helpers::base64_bytes")]
    pub encoded_data: Vec<u8>,
}

/// A set of additions or removals in one encoding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatEntrySet {
    #[serde(default)]
    pub compression_type: CompressionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hashes: Option<RawHashes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_indices: Option<RawIndices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rice_hashes: Option<RiceDeltaEncoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rice_indices: Option<RiceDeltaEncoding>,
}

impl ThreatEntrySet {
    /// Additions from uncompressed prefixes
    pub fn raw(prefix_size: i32, raw_hashes: Vec<u8>) -> Self {
        Self {
            compression_type: CompressionType::Raw,
            raw_hashes: Some(RawHashes {
                prefix_size,
                raw_hashes,
            }),
            ..Default::default()
        }
    }

    /// Removals from uncompressed indices
    pub fn raw_removals(indices: Vec<i32>) -> Self {
        Self {
            compression_type: CompressionType::Raw,
            raw_indices: Some(RawIndices { indices }),
            ..Default::default()
        }
    }

    /// Decode the hash prefixes this set adds
    pub fn decode_additions(&self) -> threatmatch_hash::Result<Vec<HashPrefix>> {
        if let Some(raw) = &self.raw_hashes {
            let size = usize::try_from(raw.prefix_size).unwrap_or(0);
            if !(MIN_HASH_PREFIX_LENGTH..=MAX_HASH_PREFIX_LENGTH).contains(&size) {
                return Err(HashError::InvalidLength(size));
            }
            if raw.raw_hashes.len() % size != 0 {
                return Err(HashError::InvalidFormat(format!(
                    "{} raw bytes are not a multiple of prefix size {}",
                    raw.raw_hashes.len(),
                    size
                )));
            }
            return raw
                .raw_hashes
                .chunks(size)
                .map(|chunk| HashPrefix::new(chunk.to_vec()))
                .collect();
        }

        if let Some(rice) = &self.rice_hashes {
            return decode_rice_hashes(
                rice.rice_parameter,
                rice.first_value,
                rice.num_entries,
                &rice.encoded_data,
            );
        }

        Ok(Vec::new())
    }

    /// Decode the list positions this set removes
    pub fn decode_removals(&self) -> threatmatch_hash::Result<Vec<u32>> {
        if let Some(raw) = &self.raw_indices {
            return raw
                .indices
                .iter()
                .map(|&index| {
                    u32::try_from(index).map_err(|_| {
                        HashError::InvalidFormat(format!("Negative removal index: {index}"))
                    })
                })
                .collect();
        }

        if let Some(rice) = &self.rice_indices {
            return decode_rice_integers(
                rice.rice_parameter,
                rice.first_value,
                rice.num_entries,
                &rice.encoded_data,
            );
        }

        Ok(Vec::new())
    }
}

/// SHA256 of the list the client should hold after applying an update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(default, with = "serde_helpers::base64_bytes")]
    pub sha256: Vec<u8>,
}

/// Update for one list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUpdateResponse {
    pub threat_type: ThreatType,
    #[serde(default = "default_entry_type")]
    pub threat_entry_type: ThreatEntryType,
    #[serde(default = "default_platform")]
    pub platform_type: PlatformType,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub additions: Vec<ThreatEntrySet>,
    #[serde(default)]
    pub removals: Vec<ThreatEntrySet>,
    #[serde(default, with = "serde_helpers::base64_bytes")]
    pub new_client_state: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

fn default_entry_type() -> ThreatEntryType {
    ThreatEntryType::Url
}

fn default_platform() -> PlatformType {
    PlatformType::AnyPlatform
}

impl ListUpdateResponse {
    pub fn is_full_update(&self) -> bool {
        self.response_type == ResponseType::FullUpdate
    }

    /// True when the response neither adds nor removes anything
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    pub fn descriptor(&self) -> ThreatDescriptor {
        ThreatDescriptor {
            threat_type: self.threat_type,
            platform_type: self.platform_type,
            threat_entry_type: self.threat_entry_type,
        }
    }
}

/// Fetch RPC response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    #[serde(default)]
    pub list_update_responses: Vec<ListUpdateResponse>,
    /// Minimum time before the next Fetch
    #[serde(
        default,
        with = "serde_helpers::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub minimum_wait_duration: Option<Duration>,
}

/// A hash, hash prefix or URL to look up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatEntry {
    #[serde(
        default,
        with = "serde_helpers::base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ThreatEntry {
    pub fn from_hash(hash: &HashPrefix) -> Self {
        Self {
            hash: hash.as_bytes().to_vec(),
            url: None,
        }
    }
}

/// What to look up and in which lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatInfo {
    #[serde(default)]
    pub threat_types: Vec<ThreatType>,
    #[serde(default)]
    pub platform_types: Vec<PlatformType>,
    #[serde(default)]
    pub threat_entry_types: Vec<ThreatEntryType>,
    #[serde(default)]
    pub threat_entries: Vec<ThreatEntry>,
}

/// Find RPC request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindRequest {
    pub client: ClientInfo,
    #[serde(default, with = "serde_helpers::base64_bytes_list")]
    pub client_states: Vec<Vec<u8>>,
    pub threat_info: ThreatInfo,
}

/// One full hash confirmed to be on a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatMatch {
    pub threat_type: ThreatType,
    #[serde(default = "default_platform")]
    pub platform_type: PlatformType,
    #[serde(default = "default_entry_type")]
    pub threat_entry_type: ThreatEntryType,
    pub threat: ThreatEntry,
    /// How long this match may be served from cache
    #[serde(
        default,
        with = "serde_helpers::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_duration: Option<Duration>,
}

/// Find RPC response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResponse {
    #[serde(default)]
    pub matches: Vec<ThreatMatch>,
    #[serde(
        default,
        with = "serde_helpers::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub minimum_wait_duration: Option<Duration>,
    /// How long the requested prefixes may be treated as clean
    #[serde(
        default,
        with = "serde_helpers::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub negative_cache_duration: Option<Duration>,
}

/// The remote side of the protocol: list updates and full hash lookups
#[async_trait]
pub trait ThreatService: Send + Sync {
    /// Fetch list updates
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Look up full hashes for the given prefixes
    async fn find(&self, request: FindRequest) -> Result<FindResponse>;
}

/// Configuration for [`HttpThreatService`]
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// The API key for authenticating with the service
    pub api_key: String,

    /// Client ID sent in the user agent
    pub client_id: String,

    /// Client version string
    pub client_version: String,

    /// Base URL for the service
    pub base_url: String,

    /// Optional HTTP proxy URL
    pub proxy_url: Option<String>,

    /// Request timeout duration
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            client_id: "threatmatch".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            base_url: API_BASE_URL.to_string(),
            proxy_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// JSON over HTTP implementation of [`ThreatService`]
#[derive(Clone)]
pub struct HttpThreatService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpThreatService {
    /// Create a new client with the provided configuration
    pub fn new(config: &ApiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Configuration("API key is required".to_string()));
        }

        let mut client_builder = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("{}/{}", config.client_id, config.client_version))
            .gzip(true);

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| Error::Configuration(format!("Invalid proxy URL: {e}")))?;
            client_builder = client_builder.proxy(proxy);
        }

        let client = client_builder
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Get the API base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T, R>(&self, path: &str, request: &T) -> Result<R>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making API request to: {}", url);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn handle_response<R: DeserializeOwned>(&self, response: Response) -> Result<R> {
        let status = response.status();
        debug!("API response status: {}", status);

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read response body".to_string());

            let api_error = ApiError::from_status(status.as_u16(), body, retry_after);
            error!("API request failed: {}", api_error);
            return Err(Error::Api(api_error));
        }

        let body = response.bytes().await?;
        debug!("Response size: {} bytes", body.len());
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ThreatService for HttpThreatService {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.post_json(THREAT_LIST_UPDATES_PATH, &request).await
    }

    async fn find(&self, request: FindRequest) -> Result<FindResponse> {
        self.post_json(FULL_HASHES_PATH, &request).await
    }
}
