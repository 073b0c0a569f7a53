//! Conformance checks for `Datastore` implementations.
//!
//! Intended for integration tests in backend crates. Each check works under
//! its own key namespace so the checks can share one datastore.

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::key::Key;
use crate::query::{Order, Query};

pub async fn check_all(ds: &dyn Datastore) -> Result<()> {
    check_not_found(ds).await.context("not found")?;
    check_round_trip(ds).await.context("round trip")?;
    check_overwrite(ds).await.context("overwrite")?;
    check_delete(ds).await.context("delete")?;
    check_query_keys_only(ds).await.context("keys-only query")?;
    check_query_values(ds).await.context("value query")?;
    check_query_prefix(ds).await.context("prefix query")?;
    check_query_order_limit(ds).await.context("ordered query")?;
    check_batch(ds).await.context("batch")?;
    check_disk_usage(ds).await.context("disk usage")?;
    Ok(())
}

pub async fn check_not_found(ds: &dyn Datastore) -> Result<()> {
    let key = Key::new("/suite/not-found/never-written");
    match ds.get(&key).await {
        Err(DatastoreError::NotFound) => {}
        Ok(_) => bail!("get returned a value for {key}"),
        Err(e) => bail!("get for {key} returned {e} instead of not found"),
    }
    if ds.has(&key).await? {
        bail!("has reported {key} present");
    }
    match ds.get_size(&key).await {
        Err(DatastoreError::NotFound) => Ok(()),
        Ok(size) => bail!("get_size returned {size} for {key}"),
        Err(e) => bail!("get_size for {key} returned {e} instead of not found"),
    }
}

pub async fn check_round_trip(ds: &dyn Datastore) -> Result<()> {
    let cases: [(&str, &[u8]); 3] = [
        ("/suite/round-trip/text", b"hello world"),
        ("/suite/round-trip/binary", &[0, 255, 1, 254, 0, 0]),
        ("/suite/round-trip/empty", b""),
    ];
    for (key, value) in cases {
        let key = Key::new(key);
        ds.put(&key, Bytes::copy_from_slice(value)).await?;
        let got = ds.get(&key).await?;
        if got.as_ref() != value {
            bail!("value mismatch for {key} ({} vs {} bytes)", got.len(), value.len());
        }
        if !ds.has(&key).await? {
            bail!("has reported {key} absent after put");
        }
        let size = ds.get_size(&key).await?;
        if size != value.len() as u64 {
            bail!("get_size for {key} returned {size}, expected {}", value.len());
        }
    }
    Ok(())
}

pub async fn check_overwrite(ds: &dyn Datastore) -> Result<()> {
    let key = Key::new("/suite/overwrite/key");
    ds.put(&key, Bytes::from("first value")).await?;
    ds.put(&key, Bytes::from("second")).await?;
    let got = ds.get(&key).await?;
    if got != Bytes::from("second") {
        bail!("expected latest value for {key}, got {:?}", got);
    }
    Ok(())
}

pub async fn check_delete(ds: &dyn Datastore) -> Result<()> {
    let absent = Key::new("/suite/delete/absent");
    ds.delete(&absent)
        .await
        .with_context(|| format!("deleting absent {absent}"))?;

    let key = Key::new("/suite/delete/present");
    ds.put(&key, Bytes::from("doomed")).await?;
    ds.delete(&key).await?;
    if ds.has(&key).await? {
        bail!("has reported {key} present after delete");
    }
    match ds.get(&key).await {
        Err(DatastoreError::NotFound) => {}
        Ok(_) => bail!("get returned a value for deleted {key}"),
        Err(e) => return Err(e.into()),
    }
    ds.delete(&key)
        .await
        .with_context(|| format!("deleting {key} twice"))?;
    Ok(())
}

pub async fn check_query_keys_only(ds: &dyn Datastore) -> Result<()> {
    let count = 25;
    for i in 0..count {
        let key = Key::new(format!("/suite/keys-only/{i:03}"));
        ds.put(&key, Bytes::from(format!("value-{i}"))).await?;
    }
    let entries = ds
        .query(Query::with_prefix("/suite/keys-only").keys_only())
        .await?
        .rest()
        .await?;
    if entries.len() != count {
        bail!("expected {count} entries, got {}", entries.len());
    }
    let mut keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
    keys.sort();
    keys.dedup();
    if keys.len() != count {
        bail!("duplicate keys in keys-only listing");
    }
    if let Some(e) = entries.iter().find(|e| e.value.is_some()) {
        bail!("keys-only query returned a value for {}", e.key);
    }
    Ok(())
}

pub async fn check_query_values(ds: &dyn Datastore) -> Result<()> {
    let count = 25;
    for i in 0..count {
        let key = Key::new(format!("/suite/values/{i:03}"));
        ds.put(&key, Bytes::from(format!("value-{i}"))).await?;
    }
    let entries = ds
        .query(Query::with_prefix("/suite/values"))
        .await?
        .rest()
        .await?;
    if entries.len() != count {
        bail!("expected {count} entries, got {}", entries.len());
    }
    for entry in entries {
        let index: usize = entry
            .key
            .name()
            .parse()
            .with_context(|| format!("unexpected key {}", entry.key))?;
        let expected = Bytes::from(format!("value-{index}"));
        if entry.value.as_ref() != Some(&expected) {
            bail!("wrong value for {}: {:?}", entry.key, entry.value);
        }
        if entry.size != expected.len() as u64 {
            bail!("wrong size for {}: {}", entry.key, entry.size);
        }
    }
    Ok(())
}

pub async fn check_query_prefix(ds: &dyn Datastore) -> Result<()> {
    ds.put(&Key::new("/suite/prefix/a/b"), Bytes::from("hello")).await?;
    ds.put(&Key::new("/suite/prefix/a/c"), Bytes::from("world")).await?;
    ds.put(&Key::new("/suite/prefix/ab"), Bytes::from("outside")).await?;

    let mut entries = ds
        .query(Query::with_prefix("/suite/prefix/a/"))
        .await?
        .rest()
        .await?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    let got: Vec<_> = entries
        .iter()
        .map(|e| (e.key.as_str(), e.value.clone()))
        .collect();
    let expected = vec![
        ("/suite/prefix/a/b", Some(Bytes::from("hello"))),
        ("/suite/prefix/a/c", Some(Bytes::from("world"))),
    ];
    if got != expected {
        bail!("unexpected prefix listing: {:?}", got);
    }
    Ok(())
}

pub async fn check_query_order_limit(ds: &dyn Datastore) -> Result<()> {
    for name in ["e", "a", "d", "b", "c"] {
        ds.put(&Key::new(format!("/suite/ordered/{name}")), Bytes::from(name))
            .await?;
    }
    let query = Query {
        prefix: "/suite/ordered".to_string(),
        orders: vec![Order::ByKey],
        offset: 1,
        limit: 3,
        ..Default::default()
    };
    let entries = ds.query(query).await?.rest().await?;
    let got: Vec<_> = entries.iter().map(|e| e.key.name()).collect();
    if got != ["b", "c", "d"] {
        bail!("unexpected ordered page: {:?}", got);
    }
    Ok(())
}

pub async fn check_batch(ds: &dyn Datastore) -> Result<()> {
    let keep = Key::new("/suite/batch/keep");
    let removed = Key::new("/suite/batch/removed");
    ds.put(&removed, Bytes::from("old")).await?;

    let mut batch = ds.batch()?;
    batch.put(keep.clone(), Bytes::from("kept"));
    batch.delete(removed.clone());
    batch.commit().await?;

    if ds.get(&keep).await? != Bytes::from("kept") {
        bail!("batched put not applied for {keep}");
    }
    if ds.has(&removed).await? {
        bail!("batched delete not applied for {removed}");
    }
    Ok(())
}

pub async fn check_disk_usage(ds: &dyn Datastore) -> Result<()> {
    match ds.disk_usage().await {
        Ok(_) | Err(DatastoreError::Unsupported(_)) => Ok(()),
        Err(e) => bail!("disk_usage failed: {e}"),
    }
}
