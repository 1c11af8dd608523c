use std::time::Duration;

use freight_adapters::{AuthError, CatalogClient, KfzAuthenticator, KfzSettings, RemoteError, SessionAuthenticator};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings_for(server: &MockServer) -> KfzSettings {
    KfzSettings {
        login_url: format!("{}/Pc/Login/account", server.uri()),
        api_base: format!("{}/goods", server.uri()),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ..KfzSettings::default()
    }
}

async fn mount_successful_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/Pc/Login/account"))
        .and(body_string_contains("loginName=shop"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "PHPSESSID=abc123; Path=/")
                .set_body_json(json!({ "status": true })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn login_then_fetch_profiles_and_pages() {
    let server = MockServer::start().await;
    mount_successful_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/goods/getBaseSelectData"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "errCode": 0,
            "result": { "mouldList": [
                { "mouldName": "Standard", "mouldId": 943965 },
                { "mouldName": "Heavy", "mouldId": "943966" }
            ]}
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/goods/unSold/list"))
        .and(body_partial_json(json!({
            "requestType": "onSale",
            "priceMin": "0",
            "priceMax": "50",
            "page": 2,
            "size": 200
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "errCode": 0,
            "result": { "productInfoPageResult": {
                "list": [
                    { "itemId": 11, "itemSn": "A-1", "name": "First", "price": "10.00", "mouldId": 1, "mouldName": "Old" },
                    { "itemId": 12, "itemSn": "A-2", "name": "Second", "price": 20 }
                ],
                "pager": { "pages": 3 }
            }}
        })))
        .mount(&server)
        .await;

    let client = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "secret")
        .await
        .expect("login");

    let catalog = client.fetch_profile_catalog().await.expect("catalog");
    assert_eq!(catalog.resolve("Standard"), Some("943965"));
    assert_eq!(catalog.resolve("Heavy"), Some("943966"));
    assert_eq!(catalog.resolve("Missing"), None);

    let page = client
        .fetch_listings_page("0", "50", 2, 200)
        .await
        .expect("page");
    assert_eq!(page.current_page, 2);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].item_id, "11");
    assert_eq!(page.items[0].profile_name, "Old");
    assert_eq!(page.items[1].price, "20");
}

#[tokio::test]
async fn bulk_change_sends_integer_ids_and_decodes_outcome() {
    let server = MockServer::start().await;
    mount_successful_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/goods/batchUpdate"))
        .and(body_partial_json(json!({
            "updateType": "mouldId",
            "itemIds": [101, 102],
            "value": "943965",
            "itemUnit": "0.5",
            "modifyType": "all"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "errCode": 0,
            "result": { "successIds": ["101"], "failIds": [102], "message": "部分成功" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "secret")
        .await
        .expect("login");
    let outcome = client
        .submit_bulk_profile_change(&[101, 102], "943965", "0.5")
        .await
        .expect("bulk change");

    assert_eq!(outcome.success_ids, ["101"]);
    assert_eq!(outcome.fail_ids, ["102"]);
    assert_eq!(outcome.message.as_deref(), Some("部分成功"));
    assert!(outcome.succeeded("101"));
    assert!(!outcome.succeeded("102"));
}

#[tokio::test]
async fn service_errors_surface_the_remote_message() {
    let server = MockServer::start().await;
    mount_successful_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/goods/getBaseSelectData"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": false,
            "errCode": 401,
            "errMessage": "请重新登录"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/goods/unSold/list"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "secret")
        .await
        .expect("login");

    match client.fetch_profile_catalog().await {
        Err(RemoteError::Service(message)) => assert_eq!(message, "请重新登录"),
        other => panic!("unexpected: {other:?}"),
    }
    match client.fetch_listings_page("0", "50", 1, 200).await {
        Err(RemoteError::HttpStatus { status, .. }) => assert_eq!(status, 502),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn login_reports_service_error_code_and_info() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Pc/Login/account"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "PHPSESSID=abc123; Path=/")
                .set_body_json(json!({ "errCode": 1001, "errInfo": "密码错误" })),
        )
        .mount(&server)
        .await;

    let err = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "wrong")
        .await
        .err()
        .expect("login should fail");
    match err {
        AuthError::Rejected(message) => assert_eq!(message, "1001: 密码错误"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn login_without_session_cookie_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Pc/Login/account"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>captcha</html>"))
        .mount(&server)
        .await;

    let err = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "secret")
        .await
        .err()
        .expect("login should fail");
    assert!(matches!(err, AuthError::Rejected(ref m) if m == "unknown error"));
}

#[tokio::test]
async fn login_http_failure_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Pc/Login/account"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = KfzAuthenticator::new(settings_for(&server))
        .login("shop", "secret")
        .await
        .err()
        .expect("login should fail");
    assert!(matches!(err, AuthError::Rejected(ref m) if m == "HTTP Error: 503"));
}
