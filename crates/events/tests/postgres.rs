//! End-to-end event processing against a live PostgreSQL with PostGIS.
//! Run with a `DATABASE_URL` pointing at a scratch database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/schematools_test cargo test -p events -- --ignored
//! ```

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use events::{Event, EventMeta, EventType, EventsProcessor};
use models::DatasetSchema;

fn bag_dataset() -> Arc<DatasetSchema> {
    Arc::new(
        DatasetSchema::from_value(json!({
            "id": "bag",
            "type": "dataset",
            "crs": "EPSG:28992",
            "tables": [{
                "id": "verblijfsobjecten",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "identifier": ["identificatie"],
                    "required": ["identificatie"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "gebruiksdoel": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "code": {"type": "string"},
                                    "omschrijving": {"type": "string"}
                                }
                            }
                        }
                    }
                }
            }]
        }))
        .unwrap(),
    )
}

fn nap_dataset() -> Arc<DatasetSchema> {
    Arc::new(
        DatasetSchema::from_value(json!({
            "id": "nap",
            "type": "dataset",
            "crs": "EPSG:28992",
            "tables": [{
                "id": "peilmerken",
                "type": "table",
                "schema": {
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "identifier": ["identificatie"],
                    "required": ["identificatie"],
                    "properties": {
                        "identificatie": {"type": "string"},
                        "hoogteTovNap": {"type": "number"},
                        "ligtInBouwblok": {
                            "type": "object",
                            "relation": "gebieden:bouwblokken",
                            "properties": {
                                "identificatie": {"type": "string"},
                                "volgnummer": {"type": "integer"}
                            }
                        }
                    }
                }
            }]
        }))
        .unwrap(),
    )
}

fn event(
    event_type: EventType,
    event_id: i64,
    dataset_id: &str,
    table_id: &str,
    data: Value,
) -> Event {
    let Value::Object(data) = data else {
        panic!("event data must be an object");
    };
    Event {
        meta: EventMeta {
            event_type,
            event_id,
            dataset_id: dataset_id.to_string(),
            table_id: table_id.to_string(),
            full_load_sequence: false,
            first_of_sequence: false,
            last_of_sequence: false,
        },
        data,
    }
}

fn sequenced(mut event: Event, first: bool, last: bool) -> Event {
    event.meta.full_load_sequence = true;
    event.meta.first_of_sequence = first;
    event.meta.last_of_sequence = last;
    event
}

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/schematools_test".to_string());
    PgPool::connect(&url).await.expect("test database reachable")
}

async fn fetch_rows(pool: &PgPool, sql: &str) -> Vec<sqlx::postgres::PgRow> {
    sqlx::query(sql).fetch_all(pool).await.unwrap()
}

async fn watermark(pool: &PgPool, table: &str) -> Option<i64> {
    sqlx::query_scalar::<_, Option<i64>>(
        "SELECT last_event_id FROM benk_lasteventids WHERE \"table\" = $1",
    )
    .bind(table)
    .fetch_optional(pool)
    .await
    .unwrap()
    .flatten()
}

#[tokio::test]
#[ignore = "needs a running PostgreSQL with PostGIS"]
async fn nested_insert_populates_sub_table() {
    let pool = pool().await;
    let mut processor = EventsProcessor::new(vec![bag_dataset()], pool.clone(), true)
        .await
        .unwrap();

    processor
        .process_event(
            event(
                EventType::Add,
                1,
                "bag",
                "verblijfsobjecten",
                json!({
                    "identificatie": "VB.1",
                    "gebruiksdoel": [
                        {"code": "1", "omschrijving": "doel 1"},
                        {"code": "2", "omschrijving": "doel 2"}
                    ]
                }),
            ),
            false,
        )
        .await
        .unwrap();

    let rows = fetch_rows(&pool, "SELECT * FROM bag_verblijfsobjecten").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<String, _>("identificatie"), "VB.1");

    let nested =
        fetch_rows(&pool, "SELECT * FROM bag_verblijfsobjecten_gebruiksdoel ORDER BY code").await;
    assert_eq!(nested.len(), 2);
    for row in &nested {
        assert_eq!(row.get::<String, _>("parent_id"), "VB.1");
    }
    assert_eq!(nested[1].get::<String, _>("omschrijving"), "doel 2");
}

#[tokio::test]
#[ignore = "needs a running PostgreSQL with PostGIS"]
async fn watermark_skips_stale_events() {
    let pool = pool().await;
    let mut processor = EventsProcessor::new(vec![bag_dataset()], pool.clone(), true)
        .await
        .unwrap();
    sqlx::query("DELETE FROM benk_lasteventids")
        .execute(&pool)
        .await
        .unwrap();

    processor
        .process_event(
            event(
                EventType::Add,
                210,
                "bag",
                "verblijfsobjecten",
                json!({"identificatie": "2"}),
            ),
            false,
        )
        .await
        .unwrap();

    // A stale MODIFY must neither change the row nor move the watermark.
    processor
        .process_event(
            event(
                EventType::Modify,
                204,
                "bag",
                "verblijfsobjecten",
                json!({"identificatie": "2", "gebruiksdoel": []}),
            ),
            false,
        )
        .await
        .unwrap();

    assert_eq!(watermark(&pool, "bag_verblijfsobjecten").await, Some(210));
    let rows = fetch_rows(&pool, "SELECT * FROM bag_verblijfsobjecten").await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
#[ignore = "needs a running PostgreSQL with PostGIS"]
async fn full_load_sequence_replaces_active_table() {
    let pool = pool().await;
    let mut processor = EventsProcessor::new(vec![bag_dataset()], pool.clone(), true)
        .await
        .unwrap();
    sqlx::query("DELETE FROM benk_lasteventids")
        .execute(&pool)
        .await
        .unwrap();

    // Pre-existing row via a normal event.
    processor
        .process_event(
            event(
                EventType::Add,
                1,
                "bag",
                "verblijfsobjecten",
                json!({"identificatie": "OLD"}),
            ),
            false,
        )
        .await
        .unwrap();

    let events: Vec<Event> = [("A", 2, true, false), ("B", 3, false, false), ("C", 4, false, true)]
        .into_iter()
        .map(|(id, event_id, first, last)| {
            sequenced(
                event(
                    EventType::Add,
                    event_id,
                    "bag",
                    "verblijfsobjecten",
                    json!({"identificatie": id}),
                ),
                first,
                last,
            )
        })
        .collect();
    processor.process_events(&events, false).await.unwrap();

    let rows = fetch_rows(
        &pool,
        "SELECT identificatie FROM bag_verblijfsobjecten ORDER BY identificatie",
    )
    .await;
    let ids: Vec<String> = rows.iter().map(|r| r.get("identificatie")).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);

    // The shadow table is gone and the watermark moved to the active one.
    let shadow_exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM information_schema.tables \
         WHERE table_name = 'bag_verblijfsobjecten_full_load' LIMIT 1",
    )
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(shadow_exists.is_none());
    assert_eq!(watermark(&pool, "bag_verblijfsobjecten").await, Some(4));
}

#[tokio::test]
#[ignore = "needs a running PostgreSQL with PostGIS"]
async fn redelivered_sequence_end_with_empty_shadow_is_a_no_op() {
    let pool = pool().await;
    let mut processor = EventsProcessor::new(vec![bag_dataset()], pool.clone(), true)
        .await
        .unwrap();
    sqlx::query("DELETE FROM benk_lasteventids")
        .execute(&pool)
        .await
        .unwrap();

    // A completed sequence...
    let events: Vec<Event> = [("A", 10, true, false), ("B", 11, false, true)]
        .into_iter()
        .map(|(id, event_id, first, last)| {
            sequenced(
                event(
                    EventType::Add,
                    event_id,
                    "bag",
                    "verblijfsobjecten",
                    json!({"identificatie": id}),
                ),
                first,
                last,
            )
        })
        .collect();
    processor.process_events(&events, false).await.unwrap();

    // ... whose final event is redelivered after the swap.
    let redelivered = vec![sequenced(
        event(
            EventType::Add,
            11,
            "bag",
            "verblijfsobjecten",
            json!({"identificatie": "B"}),
        ),
        false,
        true,
    )];
    processor.process_events(&redelivered, true).await.unwrap();

    let rows = fetch_rows(&pool, "SELECT * FROM bag_verblijfsobjecten").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(watermark(&pool, "bag_verblijfsobjecten").await, Some(11));
}

#[tokio::test]
#[ignore = "needs a running PostgreSQL with PostGIS"]
async fn relation_events_denormalize_onto_parent() {
    let pool = pool().await;
    let mut processor = EventsProcessor::new(vec![nap_dataset()], pool.clone(), true)
        .await
        .unwrap();
    sqlx::query("DELETE FROM benk_lasteventids")
        .execute(&pool)
        .await
        .unwrap();

    processor
        .process_event(
            event(
                EventType::Add,
                1,
                "nap",
                "peilmerken",
                json!({"identificatie": "70780001", "hoogteTovNap": 1.5}),
            ),
            false,
        )
        .await
        .unwrap();

    let relation_row = json!({
        "id": 1,
        "peilmerken_id": "70780001",
        "ligt_in_bouwblok_id": "03630012095746.1",
        "ligt_in_bouwblok_identificatie": "03630012095746",
        "ligt_in_bouwblok_volgnummer": 1
    });
    processor
        .process_event(
            event(
                EventType::Add,
                2,
                "nap",
                "peilmerken_ligtInBouwblok",
                relation_row.clone(),
            ),
            false,
        )
        .await
        .unwrap();

    let parents = fetch_rows(&pool, "SELECT * FROM nap_peilmerken").await;
    assert_eq!(
        parents[0].get::<Option<String>, _>("ligt_in_bouwblok_id"),
        Some("03630012095746.1".to_string())
    );
    let relations = fetch_rows(&pool, "SELECT * FROM nap_peilmerken_ligt_in_bouwblok").await;
    assert_eq!(relations.len(), 1);

    // Deleting the relation row nulls the parent columns again.
    processor
        .process_event(
            event(
                EventType::Delete,
                3,
                "nap",
                "peilmerken_ligtInBouwblok",
                relation_row,
            ),
            false,
        )
        .await
        .unwrap();
    let parents = fetch_rows(&pool, "SELECT * FROM nap_peilmerken").await;
    assert_eq!(parents[0].get::<Option<String>, _>("ligt_in_bouwblok_id"), None);
    assert_eq!(
        parents[0].get::<Option<i64>, _>("ligt_in_bouwblok_volgnummer"),
        None
    );
}
