use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use threatmatch::threatmatch_api::{
    self, Checksum, ListUpdateResponse, ResponseType, ThreatEntrySet, ThreatMatch,
};
use threatmatch::threatmatch_hash::PrefixList;
use threatmatch::{
    Config, Database, DatabaseError, Error, FetchRequest, FetchResponse, FindRequest,
    FindResponse, HashPrefix, MemoryDatabase, PlatformType, ThreatEntry, ThreatEntryType,
    ThreatMatcher, ThreatService, ThreatType, Verdict,
};

/// Threat service answering from queued responses and recording requests
#[derive(Default)]
struct ScriptedService {
    fetch_responses: Mutex<VecDeque<threatmatch_api::Result<FetchResponse>>>,
    find_responses: Mutex<VecDeque<threatmatch_api::Result<FindResponse>>>,
    fetch_requests: Mutex<Vec<FetchRequest>>,
    find_requests: Mutex<Vec<FindRequest>>,
}

impl ScriptedService {
    fn push_fetch(&self, response: threatmatch_api::Result<FetchResponse>) {
        self.fetch_responses.lock().unwrap().push_back(response);
    }

    fn push_find(&self, response: threatmatch_api::Result<FindResponse>) {
        self.find_responses.lock().unwrap().push_back(response);
    }

    fn find_calls(&self) -> usize {
        self.find_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ThreatService for ScriptedService {
    async fn fetch(&self, request: FetchRequest) -> threatmatch_api::Result<FetchResponse> {
        self.fetch_requests.lock().unwrap().push(request);
        self.fetch_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(threatmatch_api::Error::Service("no response".to_string())))
    }

    async fn find(&self, request: FindRequest) -> threatmatch_api::Result<FindResponse> {
        self.find_requests.lock().unwrap().push(request);
        self.find_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(threatmatch_api::Error::Service("no response".to_string())))
    }
}

const EVIL_URL: &str = "http://evil.example/malware.html";
const EVIL_EXPRESSION: &str = "evil.example/malware.html";

fn full_update(threat_type: ThreatType, expressions: &[&str], state: &[u8]) -> ListUpdateResponse {
    let prefixes: Vec<HashPrefix> = expressions
        .iter()
        .map(|e| HashPrefix::full_hash(e).truncate(4).unwrap())
        .collect();
    let raw: Vec<u8> = prefixes.iter().flat_map(|p| p.as_bytes().to_vec()).collect();
    let checksum = PrefixList::from_unsorted(prefixes).checksum();

    ListUpdateResponse {
        threat_type,
        threat_entry_type: ThreatEntryType::Url,
        platform_type: PlatformType::AnyPlatform,
        response_type: ResponseType::FullUpdate,
        additions: vec![ThreatEntrySet::raw(4, raw)],
        removals: vec![],
        new_client_state: state.to_vec(),
        checksum: Some(Checksum {
            sha256: checksum.to_vec(),
        }),
    }
}

fn fetch_response(lists: Vec<ListUpdateResponse>) -> FetchResponse {
    FetchResponse {
        list_update_responses: lists,
        minimum_wait_duration: None,
    }
}

fn threat_match(threat_type: ThreatType, expression: &str) -> ThreatMatch {
    ThreatMatch {
        threat_type,
        platform_type: PlatformType::AnyPlatform,
        threat_entry_type: ThreatEntryType::Url,
        threat: ThreatEntry::from_hash(&HashPrefix::full_hash(expression)),
        cache_duration: Some(Duration::from_secs(300)),
    }
}

async fn setup(lists: Vec<ListUpdateResponse>) -> (ThreatMatcher, Arc<ScriptedService>) {
    let service = Arc::new(ScriptedService::default());
    service.push_fetch(Ok(fetch_response(lists)));

    let matcher = ThreatMatcher::new(
        Config::default(),
        Arc::new(MemoryDatabase::new()),
        service.clone(),
    )
    .unwrap();
    matcher.update().await.unwrap();
    (matcher, service)
}

#[tokio::test]
async fn test_unlisted_url_is_safe_without_lookup() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;

    let verdict = matcher.check_url("http://fine.example/index.html").await.unwrap();
    assert_eq!(verdict, Verdict::Safe);
    assert_eq!(service.find_calls(), 0);
}

#[tokio::test]
async fn test_confirmed_match_is_dangerous_and_cached() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;
    service.push_find(Ok(FindResponse {
        matches: vec![threat_match(ThreatType::Malware, EVIL_EXPRESSION)],
        minimum_wait_duration: None,
        negative_cache_duration: Some(Duration::from_secs(300)),
    }));

    let verdict = matcher.check_url(EVIL_URL).await.unwrap();
    assert_eq!(verdict, Verdict::Dangerous(ThreatType::Malware));

    {
        let requests = service.find_requests.lock().unwrap();
        let threat_info = &requests[0].threat_info;
        let expected_prefix = HashPrefix::full_hash(EVIL_EXPRESSION).truncate(4).unwrap();
        assert_eq!(
            threat_info.threat_entries,
            vec![ThreatEntry::from_hash(&expected_prefix)]
        );
        assert_eq!(threat_info.threat_types, ThreatType::LISTED.to_vec());
        assert_eq!(threat_info.platform_types, vec![PlatformType::AnyPlatform]);
        assert_eq!(requests[0].client_states, vec![b"v1".to_vec()]);
    }

    // Served from cache
    let verdict = matcher.check_url(EVIL_URL).await.unwrap();
    assert_eq!(verdict, Verdict::Dangerous(ThreatType::Malware));
    assert_eq!(service.find_calls(), 1);

    let stats = matcher.stats().await;
    assert_eq!(stats.queries_by_api, 1);
    assert_eq!(stats.queries_by_cache, 1);
}

#[tokio::test]
async fn test_unconfirmed_prefix_is_safe_and_negatively_cached() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;
    service.push_find(Ok(FindResponse {
        matches: vec![],
        minimum_wait_duration: None,
        negative_cache_duration: Some(Duration::from_secs(300)),
    }));

    assert_eq!(matcher.check_url(EVIL_URL).await.unwrap(), Verdict::Safe);
    assert_eq!(matcher.check_url(EVIL_URL).await.unwrap(), Verdict::Safe);
    assert_eq!(service.find_calls(), 1);
    assert_eq!(matcher.cache_stats().await.negative_entries, 1);
}

#[tokio::test]
async fn test_match_for_other_hash_is_ignored() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;
    service.push_find(Ok(FindResponse {
        matches: vec![threat_match(ThreatType::Malware, "evil.example/other.html")],
        minimum_wait_duration: None,
        negative_cache_duration: None,
    }));

    assert_eq!(matcher.check_url(EVIL_URL).await.unwrap(), Verdict::Safe);
}

#[tokio::test]
async fn test_most_severe_threat_wins() {
    let (matcher, service) = setup(vec![
        full_update(ThreatType::Malware, &["evil.example/"], b"m1"),
        full_update(ThreatType::SocialEngineering, &[EVIL_EXPRESSION], b"s1"),
    ])
    .await;
    service.push_find(Ok(FindResponse {
        matches: vec![
            threat_match(ThreatType::SocialEngineering, EVIL_EXPRESSION),
            threat_match(ThreatType::Malware, "evil.example/"),
        ],
        minimum_wait_duration: None,
        negative_cache_duration: None,
    }));

    let verdict = matcher.check_url(EVIL_URL).await.unwrap();
    assert_eq!(verdict, Verdict::Dangerous(ThreatType::Malware));

    let requests = service.find_requests.lock().unwrap();
    assert_eq!(requests[0].threat_info.threat_entries.len(), 2);
}

#[tokio::test]
async fn test_find_failure_backs_off() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;
    service.push_find(Err(threatmatch_api::Error::Service("down".to_string())));

    let result = matcher.check_url(EVIL_URL).await;
    assert!(matches!(result, Err(Error::Network(_))));

    // No second lookup while backing off
    assert_eq!(matcher.check_url(EVIL_URL).await.unwrap(), Verdict::Unknown);
    assert_eq!(service.find_calls(), 1);

    // URLs without a local match are still answered
    assert_eq!(
        matcher.check_url("http://fine.example/").await.unwrap(),
        Verdict::Safe
    );
    assert_eq!(matcher.stats().await.queries_fail, 1);
}

#[tokio::test]
async fn test_update_sends_stored_state_and_constraints() {
    let (matcher, service) =
        setup(vec![full_update(ThreatType::Malware, &[EVIL_EXPRESSION], b"v1")]).await;
    service.push_fetch(Ok(fetch_response(vec![])));
    matcher.update().await.unwrap();

    let requests = service.fetch_requests.lock().unwrap();
    assert_eq!(requests.len(), 2);

    let first = &requests[0].list_update_requests;
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|r| r.state.is_empty()));

    let malware = requests[1]
        .list_update_requests
        .iter()
        .find(|r| r.threat_type == ThreatType::Malware)
        .unwrap();
    assert_eq!(malware.state, b"v1");
    assert_eq!(
        malware.constraints.as_ref().unwrap().max_update_entries,
        2048
    );
}

#[tokio::test]
async fn test_rejected_list_keeps_previous_version() {
    let database = Arc::new(MemoryDatabase::new());
    let service = Arc::new(ScriptedService::default());
    let matcher =
        ThreatMatcher::new(Config::default(), database.clone(), service.clone()).unwrap();

    service.push_fetch(Ok(fetch_response(vec![full_update(
        ThreatType::Malware,
        &[EVIL_EXPRESSION],
        b"v1",
    )])));
    matcher.update().await.unwrap();

    let mut corrupt = full_update(ThreatType::Malware, &["other.example/"], b"v2");
    corrupt.checksum = Some(Checksum {
        sha256: vec![0; 32],
    });
    service.push_fetch(Ok(fetch_response(vec![corrupt])));

    let result = matcher.update().await;
    assert!(matches!(
        result,
        Err(Error::Database(DatabaseError::ChecksumMismatch { .. }))
    ));
    assert_eq!(database.get_state(ThreatType::Malware).await.unwrap(), b"v1");
    assert_eq!(matcher.stats().await.updates_fail, 1);
}

#[tokio::test]
async fn test_next_update_delay_honours_minimum_wait() {
    let service = Arc::new(ScriptedService::default());
    service.push_fetch(Ok(FetchResponse {
        list_update_responses: vec![],
        minimum_wait_duration: Some(Duration::from_secs(2 * 60 * 60)),
    }));
    let matcher = ThreatMatcher::new(
        Config::default(),
        Arc::new(MemoryDatabase::new()),
        service,
    )
    .unwrap();

    assert_eq!(matcher.next_update_delay().await, Duration::ZERO);
    matcher.update().await.unwrap();

    let delay = matcher.next_update_delay().await;
    assert!(delay > Duration::from_secs(60 * 60));
    assert!(delay <= Duration::from_secs(2 * 60 * 60));
}

#[tokio::test]
async fn test_find_backoff_carries_over_to_new_matcher() {
    let database = Arc::new(MemoryDatabase::new());
    let service = Arc::new(ScriptedService::default());
    service.push_fetch(Ok(fetch_response(vec![full_update(
        ThreatType::Malware,
        &[EVIL_EXPRESSION],
        b"v1",
    )])));
    service.push_find(Err(threatmatch_api::Error::Service("down".to_string())));

    let first = ThreatMatcher::new(Config::default(), database.clone(), service.clone()).unwrap();
    first.update().await.unwrap();
    assert!(first.check_url(EVIL_URL).await.is_err());
    drop(first);

    let second = ThreatMatcher::new(Config::default(), database.clone(), service.clone()).unwrap();
    assert_eq!(second.check_url(EVIL_URL).await.unwrap(), Verdict::Unknown);
    assert_eq!(service.find_calls(), 1);
    assert_eq!(database.backoff_info().await.find.retries, 1);
}
