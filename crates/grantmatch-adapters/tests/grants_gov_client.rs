use std::time::Duration;

use axum::{routing::post, Json, Router};
use grantmatch_adapters::{
    consolidate, fetch_all_posted, map_to_grant_record, DetailBatcher, GrantSource,
    GrantsGovClient, HttpClientConfig, PaginationStop, SourceError,
};
use serde_json::{json, Value};

async fn search(Json(body): Json<Value>) -> Json<Value> {
    assert_eq!(body["oppStatuses"], "posted");
    let start = body["startRecordNum"].as_u64().unwrap_or(0);
    let hits = match start {
        0 => json!([
            {"id": "100", "title": "AI Research Initiative", "agencyCode": "NSF",
             "agency": "U.S. National Science Foundation", "openDate": "01/15/2026",
             "closeDate": "06/30/2026", "oppStatus": "posted", "cfdaList": ["47.041"]},
            {"id": "101", "title": "Rural Water Systems", "agencyCode": "USDA",
             "openDate": "02/01/2026", "closeDate": "07/01/2026", "cfdaList": ["10.760"]}
        ]),
        2 => json!([
            {"id": "101", "title": "Rural Water Systems", "agencyCode": "USDA"},
            {"id": "102", "title": "Missing Detail", "agencyCode": "NIH"}
        ]),
        _ => json!([]),
    };
    Json(json!({"errorcode": 0, "msg": "ok", "data": {"hitCount": 3, "oppHits": hits}}))
}

async fn fetch_opportunity(Json(body): Json<Value>) -> Json<Value> {
    match body["opportunityId"].as_str().unwrap_or_default() {
        "100" => Json(json!({
            "errorcode": 0,
            "msg": "ok",
            "data": {
                "id": 100,
                "opportunityTitle": "AI Research Initiative",
                "owningAgencyCode": "NSF",
                "synopsis": {
                    "synopsisDesc": "Supports artificial intelligence research.",
                    "agencyName": "U.S. National Science Foundation",
                    "applicantEligibilityDesc": "Institutions of higher education",
                    "awardCeiling": "$1,000,000",
                    "awardFloor": "$100,000",
                    "fundingDescLinkUrl": "https://www.nsf.gov/ai"
                },
                "cfdas": [{"cfdaNumber": "47.041", "programTitle": "Engineering"}]
            }
        })),
        "101" => Json(json!({
            "errorcode": 0,
            "msg": "ok",
            "data": {"id": 101, "opportunityTitle": "Rural Water Systems", "cfdas": []}
        })),
        _ => Json(json!({"errorcode": 5, "msg": "opportunity not found"})),
    }
}

async fn spawn_fake_grants_gov() -> String {
    let app = Router::new()
        .route("/search2", post(search))
        .route("/fetchOpportunity", post(fetch_opportunity));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: String) -> GrantsGovClient {
    GrantsGovClient::new(HttpClientConfig {
        base_url,
        timeout: Duration::from_secs(5),
        user_agent: Some("grantmatch-test".into()),
    })
    .unwrap()
}

#[tokio::test]
async fn paginates_dedupes_and_maps_against_fake_server() {
    let base = spawn_fake_grants_gov().await;
    let client = client(base);

    let outcome = fetch_all_posted(&client, 2).await;
    assert_eq!(outcome.stop, PaginationStop::Exhausted);
    assert_eq!(outcome.pages_fetched, 2);
    let ids: Vec<_> = outcome.opportunities.iter().map(|o| o.id.clone()).collect();
    assert_eq!(ids, vec!["100", "101", "102"]);

    let batcher = DetailBatcher {
        stagger: Duration::from_millis(1),
        batch_pause: Duration::from_millis(1),
        ..DetailBatcher::default()
    };
    let details = batcher.fetch_details(&client, &outcome.opportunities).await;
    assert_eq!(details.details.len(), 2);
    assert_eq!(details.failures.len(), 1);
    assert_eq!(details.failures[0].opportunity_id, "102");

    let consolidated = consolidate(outcome.opportunities, details.details);
    let now = chrono::Utc::now();
    let grants: Vec<_> = consolidated
        .iter()
        .map(|opp| map_to_grant_record(opp, now))
        .collect();

    assert_eq!(grants[0].title, "AI Research Initiative");
    assert_eq!(grants[0].funding_amount, Some(1_000_000.0));
    assert_eq!(grants[0].focus_area_titles, vec!["Engineering".to_string()]);
    assert_eq!(grants[1].agency, "Not specified");
    assert_eq!(grants[2].description, "");
}

#[tokio::test]
async fn detail_error_code_surfaces_as_api_error() {
    let base = spawn_fake_grants_gov().await;
    let err = client(base).fetch_detail("999").await.unwrap_err();
    assert!(matches!(err, SourceError::Api { code: 5, .. }));
}

#[tokio::test]
async fn unreachable_host_stops_pagination_as_transport_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let outcome = fetch_all_posted(&client(format!("http://{addr}")), 10).await;
    assert!(outcome.opportunities.is_empty());
    assert!(matches!(outcome.stop, PaginationStop::Transport(_)));
}
