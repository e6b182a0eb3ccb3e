mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    fake_encrypt, Harness, LicenseBuilder, StatusBuilder, FRESH_LICENSE_URL, LICENSE_ID, RENEW_URL,
    RETURN_URL, STATUS_URL,
};
use lcp_license::{LcpError, License, MemoryContainer, Method, RenewListener, Status};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

#[derive(Default)]
struct Listener {
    end: Option<DateTime<Utc>>,
    asked: Mutex<Vec<Option<DateTime<Utc>>>>,
    opened: Mutex<Vec<String>>,
}

#[async_trait]
impl RenewListener for Listener {
    async fn preferred_end_date(&self, max_end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        self.asked.lock().unwrap().push(max_end);
        self.end
    }

    async fn open_web_page(&self, url: &str) {
        self.opened.lock().unwrap().push(url.to_string());
    }
}

async fn open(harness: &Harness, license: &LicenseBuilder) -> License {
    open_in_container(harness, license).await.0
}

async fn open_in_container(
    harness: &Harness,
    license: &LicenseBuilder,
) -> (License, Arc<MemoryContainer>) {
    harness.remember_passphrase();
    let container = Arc::new(MemoryContainer::new(license.bytes()));
    let license = harness
        .service()
        .retrieve_license(container.clone(), None, false)
        .await
        .unwrap();
    (license, container)
}

// ── Decryption ───────────────────────────────────────────────────

#[tokio::test]
async fn decrypt_uses_provider_context() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new()).await;

    let clear = license.decrypt(&fake_encrypt(b"chapter one")).await.unwrap();
    assert_eq!(clear, b"chapter one");
    assert_eq!(harness.provider.decrypt_calls(), 1);
}

#[tokio::test]
async fn decrypt_empty_input_skips_provider() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new()).await;

    assert!(license.decrypt(&[]).await.unwrap().is_empty());
    assert_eq!(harness.provider.decrypt_calls(), 0);
}

// ── Rights ───────────────────────────────────────────────────────

#[tokio::test]
async fn copy_quota_is_consumed() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new().copy(10)).await;

    assert_eq!(license.copies_left().unwrap(), Some(10));
    assert!(license.can_copy("hello").unwrap());
    assert!(license.copy("hello").unwrap());
    assert_eq!(license.copies_left().unwrap(), Some(5));

    assert!(!license.can_copy("123456").unwrap());
    assert!(!license.copy("123456").unwrap());
    assert_eq!(license.copies_left().unwrap(), Some(5));

    assert!(license.copy("12345").unwrap());
    assert_eq!(license.copies_left().unwrap(), Some(0));
    assert!(license.can_copy("").unwrap());
}

#[tokio::test]
async fn copy_counts_characters_not_bytes() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new().copy(3)).await;
    assert!(license.copy("été").unwrap());
    assert_eq!(license.copies_left().unwrap(), Some(0));
}

#[tokio::test]
async fn print_quota_is_consumed() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new().print(4)).await;

    assert!(license.can_print(4).unwrap());
    assert!(!license.can_print(5).unwrap());
    assert!(license.print(3).unwrap());
    assert!(!license.print(2).unwrap());
    assert_eq!(license.prints_left().unwrap(), Some(1));
}

#[tokio::test]
async fn absent_quotas_are_unlimited() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new()).await;

    assert_eq!(license.copies_left().unwrap(), None);
    assert_eq!(license.prints_left().unwrap(), None);
    assert!(license.copy(&"x".repeat(100_000)).unwrap());
    assert!(license.print(10_000).unwrap());
    assert_eq!(license.copies_left().unwrap(), None);
}

#[tokio::test]
async fn quotas_survive_reopening() {
    let harness = Harness::new();
    let builder = LicenseBuilder::new().print(10);
    let license = open(&harness, &builder).await;
    assert!(license.print(6).unwrap());
    drop(license);

    let reopened = open(&harness, &builder).await;
    assert_eq!(reopened.prints_left().unwrap(), Some(4));
}

// ── Renew ────────────────────────────────────────────────────────

#[tokio::test]
async fn renew_programmatically_with_end_date() {
    let harness = Harness::new();
    let max_end = Utc::now() + Duration::days(60);
    let wanted_end = Utc::now() + Duration::days(30);
    let issued = Utc::now() - Duration::days(10);
    let builder = LicenseBuilder {
        issued,
        ..LicenseBuilder::new()
    }
    .end(Utc::now() + Duration::days(2));
    let renewed = LicenseBuilder {
        issued,
        ..LicenseBuilder::new()
    }
    .updated(Utc::now())
    .end(wanted_end);

    harness.network.ok(
        STATUS_URL,
        StatusBuilder::new("active")
            .with_renew(true)
            .potential_end(max_end)
            .bytes(),
    );
    harness.network.ok(
        RENEW_URL,
        StatusBuilder::new("active")
            .with_renew(true)
            .license_updated(Utc::now())
            .potential_end(max_end)
            .bytes(),
    );
    harness.network.ok(FRESH_LICENSE_URL, renewed.bytes());
    let license = open(&harness, &builder).await;

    assert!(license.can_renew_loan());
    assert_eq!(license.max_renew_date(), Some(max_end));

    let listener = Listener {
        end: Some(wanted_end),
        ..Listener::default()
    };
    let end = license.renew_loan(&listener, false).await.unwrap();

    assert_eq!(end, Some(wanted_end));
    assert_eq!(*listener.asked.lock().unwrap(), vec![Some(max_end)]);
    assert_eq!(license.license().as_bytes(), renewed.bytes().as_slice());

    let request = harness.network.last_request(RENEW_URL).unwrap();
    assert_eq!(request.method, Method::Put);
    assert!(request.url.contains("end="));
    assert!(request.url.contains("id="));
}

#[tokio::test]
async fn renewed_license_is_written_to_its_container() {
    let harness = Harness::new();
    let issued = Utc::now() - Duration::days(10);
    let current = LicenseBuilder {
        issued,
        ..LicenseBuilder::new()
    }
    .end(Utc::now() + Duration::days(2));
    let renewed = LicenseBuilder {
        issued,
        ..LicenseBuilder::new()
    }
    .updated(Utc::now())
    .end(Utc::now() + Duration::days(30));

    harness
        .network
        .ok(STATUS_URL, StatusBuilder::new("active").with_renew(false).bytes());
    harness.network.ok(
        RENEW_URL,
        StatusBuilder::new("active")
            .with_renew(false)
            .license_updated(Utc::now())
            .bytes(),
    );
    harness.network.ok(FRESH_LICENSE_URL, renewed.bytes());
    let (license, container) = open_in_container(&harness, &current).await;
    assert_eq!(container.data(), current.bytes());

    license.renew_loan(&Listener::default(), false).await.unwrap();

    assert_eq!(container.data(), renewed.bytes());
    assert_eq!(harness.store.license_end(LICENSE_ID), renewed.end);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renew_and_retrieve_of_one_license_run_one_at_a_time() {
    let harness = Harness::new();
    harness.remember_passphrase();
    harness
        .network
        .ok(STATUS_URL, StatusBuilder::new("active").with_renew(false).bytes());
    harness
        .network
        .ok(RENEW_URL, StatusBuilder::new("active").with_renew(false).bytes());
    let service = harness.service();
    let container = Arc::new(MemoryContainer::new(LicenseBuilder::new().bytes()));
    let license = service
        .retrieve_license(container.clone(), None, false)
        .await
        .unwrap();

    harness.provider.set_context_delay(StdDuration::from_millis(100));
    let listener = Listener::default();
    let (renewed, retrieved) = tokio::join!(
        license.renew_loan(&listener, false),
        service.retrieve_license(container.clone(), None, false),
    );

    renewed.unwrap();
    retrieved.unwrap();
    assert_eq!(harness.provider.context_calls(), 3);
    assert_eq!(harness.provider.max_concurrent_contexts(), 1);
}

#[tokio::test]
async fn renew_without_end_parameter_does_not_ask() {
    let harness = Harness::new();
    harness
        .network
        .ok(STATUS_URL, StatusBuilder::new("active").with_renew(false).bytes());
    harness
        .network
        .ok(RENEW_URL, StatusBuilder::new("active").with_renew(false).bytes());
    let license = open(&harness, &LicenseBuilder::new()).await;

    let listener = Listener::default();
    license.renew_loan(&listener, false).await.unwrap();

    assert!(listener.asked.lock().unwrap().is_empty());
    let request = harness.network.last_request(RENEW_URL).unwrap();
    assert!(!request.url.contains("end="));
    assert!(request.url.contains("name=test+device"));
}

#[tokio::test]
async fn renew_http_errors_are_mapped() {
    let max_end = Utc::now() + Duration::days(60);
    let cases: [(u16, fn(&LcpError) -> bool); 3] = [
        (400, |e| matches!(e, LcpError::RenewFailed)),
        (403, |e| matches!(e, LcpError::InvalidRenewalPeriod { max_renew_date: Some(_) })),
        (500, |e| matches!(e, LcpError::UnexpectedServerError(500))),
    ];
    for (status, check) in cases {
        let harness = Harness::new();
        harness.network.ok(
            STATUS_URL,
            StatusBuilder::new("active")
                .with_renew(false)
                .potential_end(max_end)
                .bytes(),
        );
        harness.network.respond(RENEW_URL, status, "");
        let license = open(&harness, &LicenseBuilder::new()).await;

        let err = license
            .renew_loan(&Listener::default(), false)
            .await
            .unwrap_err();
        assert!(check(&err), "HTTP {status}: unexpected {err:?}");
    }
}

#[tokio::test]
async fn renew_without_link_is_not_available() {
    let harness = Harness::new();
    harness.network.ok(STATUS_URL, StatusBuilder::new("active").bytes());
    let license = open(&harness, &LicenseBuilder::new()).await;

    assert!(!license.can_renew_loan());
    let err = license
        .renew_loan(&Listener::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, LcpError::LicenseInteractionNotAvailable));
}

#[tokio::test]
async fn renew_with_web_page() {
    let harness = Harness::new();
    let page = "https://shop.example.com/renew/ef15e740";
    let status = StatusBuilder::new("active")
        .with_renew_page(page)
        .with_renew(false);
    harness.network.ok(STATUS_URL, status.bytes());
    harness.network.ok(STATUS_URL, status.clone().potential_end(Utc::now()).bytes());
    let license = open(&harness, &LicenseBuilder::new()).await;

    let listener = Listener::default();
    license.renew_loan(&listener, true).await.unwrap();

    assert_eq!(*listener.opened.lock().unwrap(), vec![page.to_string()]);
    assert_eq!(harness.network.count(RENEW_URL), 0);
    let refetch = harness.network.last_request(STATUS_URL).unwrap();
    assert!(refetch
        .headers
        .iter()
        .any(|(k, v)| k == "Accept" && v == "application/vnd.readium.license.status.v1.0+json"));
    assert!(license.status().unwrap().potential_end().is_some());
}

#[tokio::test]
async fn programmatic_renew_is_preferred_by_default() {
    let harness = Harness::new();
    let status = StatusBuilder::new("active")
        .with_renew_page("https://shop.example.com/renew")
        .with_renew(false);
    harness.network.ok(STATUS_URL, status.bytes());
    harness.network.ok(RENEW_URL, status.bytes());
    let license = open(&harness, &LicenseBuilder::new()).await;

    let listener = Listener::default();
    license.renew_loan(&listener, false).await.unwrap();

    assert!(listener.opened.lock().unwrap().is_empty());
    assert_eq!(harness.network.count(RENEW_URL), 1);
}

// ── Return ───────────────────────────────────────────────────────

#[tokio::test]
async fn returned_publication_can_no_longer_be_decrypted() {
    let harness = Harness::new();
    harness
        .network
        .ok(STATUS_URL, StatusBuilder::new("active").with_return().bytes());
    harness
        .network
        .ok(RETURN_URL, StatusBuilder::new("returned").bytes());
    let license = open(&harness, &LicenseBuilder::new()).await;
    assert!(license.can_return_publication());

    license.return_publication().await.unwrap();

    assert_eq!(license.status().map(|s| s.status()), Some(Status::Returned));
    assert!(!license.can_return_publication());
    let err = license.decrypt(&fake_encrypt(b"page")).await.unwrap_err();
    assert!(matches!(err, LcpError::Returned { .. }));

    let request = harness.network.last_request(RETURN_URL).unwrap();
    assert_eq!(request.method, Method::Put);
    assert!(request.url.contains("id="));
}

#[tokio::test]
async fn return_http_errors_are_mapped() {
    let cases: [(u16, fn(&LcpError) -> bool); 3] = [
        (400, |e| matches!(e, LcpError::ReturnFailed)),
        (403, |e| matches!(e, LcpError::AlreadyReturnedOrExpired)),
        (502, |e| matches!(e, LcpError::UnexpectedServerError(502))),
    ];
    for (status, check) in cases {
        let harness = Harness::new();
        harness
            .network
            .ok(STATUS_URL, StatusBuilder::new("active").with_return().bytes());
        harness.network.respond(RETURN_URL, status, "");
        let license = open(&harness, &LicenseBuilder::new()).await;

        let err = license.return_publication().await.unwrap_err();
        assert!(check(&err), "HTTP {status}: unexpected {err:?}");
        assert_eq!(license.status().map(|s| s.status()), Some(Status::Active));
    }
}

#[tokio::test]
async fn return_without_status_is_not_available() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new()).await;

    assert!(!license.can_return_publication());
    let err = license.return_publication().await.unwrap_err();
    assert!(matches!(err, LcpError::LicenseInteractionNotAvailable));
}

#[tokio::test]
async fn debug_output_hides_the_context() {
    let harness = Harness::new();
    let license = open(&harness, &LicenseBuilder::new()).await;
    let debug = format!("{license:?}");
    assert!(debug.contains(common::LICENSE_ID));
    assert!(!debug.contains(&common::valid_hash()));
}
