mod common;

use std::sync::{Arc, Mutex};

use prism_engine::cache::IdentityCache;
use prism_engine::hive::InMemoryHive;
use prism_engine::model::{AliasType, IdentitySource, ResolutionSource, ResolutionStatus};
use prism_engine::resolver::{IsinResolver, ResolveContext, ResolveRequest, ScriptedResolver};

use common::{APPLE, NVDA_ISIN};

fn cache() -> Arc<Mutex<IdentityCache>> {
    Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()))
}

#[tokio::test]
async fn contributed_alias_is_locally_retrievable_with_source_confidence() {
    let hive = Arc::new(InMemoryHive::new());
    let api = Arc::new(ScriptedResolver::new(IdentitySource::OpenFigi).answers("AAPL", APPLE));
    let cache = cache();
    let resolver = IsinResolver::new(cache.clone(), hive.clone(), hive.clone(), vec![api]);

    let result = resolver
        .resolve(&ResolveRequest::ticker("aapl"))
        .await
        .unwrap();
    assert_eq!(result.source, Some(ResolutionSource::OpenFigi));

    // The fact written through the resolver is immediately served locally,
    // carrying the originating source and at least its initial confidence.
    let (isin, confidence, source) = cache
        .lock()
        .unwrap()
        .get_isin_by_alias("AAPL", AliasType::Ticker)
        .unwrap()
        .expect("alias cached after API resolution");
    assert_eq!(isin.as_str(), APPLE);
    assert_eq!(source, IdentitySource::OpenFigi);
    assert!(confidence >= IdentitySource::OpenFigi.initial_confidence());
}

#[tokio::test]
async fn exchange_suffix_variants_reach_the_api() {
    let hive = Arc::new(InMemoryHive::new());
    // The API only knows the bare symbol, not the suffixed listing.
    let api = Arc::new(ScriptedResolver::new(IdentitySource::OpenFigi).answers("NVDA", NVDA_ISIN));
    let resolver = IsinResolver::new(cache(), hive.clone(), hive, vec![api]);

    let result = resolver
        .resolve(
            &ResolveRequest::ticker("NVDA.DE").with_context(ResolveContext {
                currency: Some("EUR".into()),
                exchange: None,
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ResolutionStatus::Resolved);
    assert_eq!(result.isin.unwrap().as_str(), NVDA_ISIN);
}

#[tokio::test]
async fn resolver_is_idempotent_without_repeat_io() {
    let hive = Arc::new(InMemoryHive::new());
    let api = Arc::new(ScriptedResolver::new(IdentitySource::Wikidata).answers("SIEMENS", "DE0007236101"));
    let resolver = IsinResolver::new(cache(), hive.clone(), hive.clone(), vec![api.clone()]);

    let request = ResolveRequest::name("Siemens AG");
    let first = resolver.resolve(&request).await.unwrap();
    let io_after_first = (hive.read_calls(), api.call_count());

    let second = resolver.resolve(&request).await.unwrap();
    assert_eq!(first.isin, second.isin);
    assert_eq!(first.status, second.status);
    assert_eq!(
        (hive.read_calls(), api.call_count()),
        io_after_first,
        "second identical call must be absorbed by the caches"
    );
}

#[tokio::test]
async fn unknown_name_is_idempotently_negative() {
    let hive = Arc::new(InMemoryHive::new());
    let api = Arc::new(ScriptedResolver::new(IdentitySource::Yfinance));
    let resolver = IsinResolver::new(cache(), hive.clone(), hive.clone(), vec![api.clone()]);

    let request = ResolveRequest::name("Totally Unknown Industries");
    let first = resolver.resolve(&request).await.unwrap();
    assert_eq!(first.status, ResolutionStatus::Unresolved);
    let io_after_first = (hive.read_calls(), api.call_count());

    let second = resolver.resolve(&request).await.unwrap();
    assert_eq!(second.status, ResolutionStatus::Unresolved);
    assert!(second.negative_cache_hit);
    assert_eq!((hive.read_calls(), api.call_count()), io_after_first);
}
