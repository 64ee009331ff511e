//! Dimension discovery, latest-status aggregation and fact reconciliation.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use opstat_core::{ConnectionStatus, DimensionMapping, EventName, FactRow, Platform, StampKey};
use serde::{Deserialize, Serialize};

/// Natural keys in `incoming` that have no mapping yet (left anti-join).
///
/// The caller registers the result; surrogate keys are assigned by the store.
pub fn find_new_entities<'a, K, V>(
    incoming: impl IntoIterator<Item = &'a K>,
    known: &BTreeMap<K, V>,
) -> BTreeSet<K>
where
    K: Ord + Clone + 'a,
{
    incoming
        .into_iter()
        .filter(|key| !known.contains_key(*key))
        .cloned()
        .collect()
}

/// One row of a cleaned status table, as read back from storage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusObservation {
    pub event_id: Option<String>,
    pub company_id: Option<i64>,
    pub platform: Option<Platform>,
    pub event_name: Option<EventName>,
    pub observed_at: Option<DateTime<Utc>>,
    pub is_delete: Option<bool>,
}

impl StatusObservation {
    /// True when the event is neither INSERT nor REMOVE.
    pub fn is_skipped_event(&self) -> bool {
        self.event_name
            .as_ref()
            .is_some_and(|name| name.connection_status().is_none())
    }
}

/// Distinct non-null company ids, in ascending order.
pub fn distinct_company_ids(observations: &[StatusObservation]) -> Vec<i64> {
    observations
        .iter()
        .filter_map(|obs| obs.company_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A per-entity per-platform state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent<K> {
    pub entity_key: K,
    pub category: Platform,
    pub timestamp: Option<DateTime<Utc>>,
    pub event_name: EventName,
}

/// Latest status per `(entity, platform)`.
///
/// The event with the greatest timestamp wins; on equal timestamps the later
/// event in input order wins, and undated events never beat dated ones.
/// Events that are not INSERT/REMOVE must be filtered out beforehand and are
/// ignored here.
pub fn aggregate_latest<K>(events: &[StatusEvent<K>]) -> BTreeMap<(K, Platform), bool>
where
    K: Ord + Clone,
{
    let mut latest: BTreeMap<(K, Platform), (Option<DateTime<Utc>>, bool)> = BTreeMap::new();
    for event in events {
        let Some(status) = event.event_name.connection_status() else {
            continue;
        };
        match latest.entry((event.entity_key.clone(), event.category)) {
            Entry::Vacant(slot) => {
                slot.insert((event.timestamp, status));
            }
            Entry::Occupied(mut slot) => {
                if event.timestamp >= slot.get().0 {
                    slot.insert((event.timestamp, status));
                }
            }
        }
    }
    latest
        .into_iter()
        .map(|(pair, (_, status))| (pair, status))
        .collect()
}

/// Output of the delta policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaReconciliation<K> {
    pub connected: Vec<ConnectionStatus<K>>,
    pub disconnected: Vec<ConnectionStatus<K>>,
}

impl<K> DeltaReconciliation<K> {
    /// Disconnections first, then connections.
    pub fn into_rows(self) -> Vec<ConnectionStatus<K>> {
        let mut rows = self.disconnected;
        rows.extend(self.connected);
        rows
    }
}

/// Delta policy: pairs currently connected but no longer observed are
/// disconnected, and every observed pair is (re)connected.
///
/// Connections are emitted even when already current, so replaying the same
/// snapshot appends duplicate rows.
pub fn reconcile_delta<K>(
    current: &[ConnectionStatus<K>],
    incoming: &BTreeSet<(K, Platform)>,
    as_of: StampKey,
) -> DeltaReconciliation<K>
where
    K: Ord + Clone,
{
    let disconnected = current
        .iter()
        .filter(|row| row.status)
        .filter(|row| !incoming.contains(&(row.entity_key.clone(), row.category)))
        .map(|row| (row.entity_key.clone(), row.category))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(entity_key, category)| ConnectionStatus {
            entity_key,
            category,
            status: false,
            as_of,
        })
        .collect();

    let connected = incoming
        .iter()
        .map(|(entity_key, category)| ConnectionStatus {
            entity_key: entity_key.clone(),
            category: *category,
            status: true,
            as_of,
        })
        .collect();

    DeltaReconciliation {
        connected,
        disconnected,
    }
}

/// Snapshot policy: one row for every entity x platform, connected iff observed.
///
/// Observed pairs whose entity is not in `entities` are not emitted.
pub fn reconcile_snapshot<K>(
    entities: &BTreeSet<K>,
    categories: &[Platform],
    incoming: &BTreeSet<(K, Platform)>,
    as_of: StampKey,
) -> Vec<ConnectionStatus<K>>
where
    K: Ord + Clone,
{
    let categories: BTreeSet<Platform> = categories.iter().copied().collect();
    entities
        .iter()
        .flat_map(|entity| {
            categories.iter().map(move |category| {
                let pair = (entity.clone(), *category);
                ConnectionStatus {
                    status: incoming.contains(&pair),
                    entity_key: pair.0,
                    category: pair.1,
                    as_of,
                }
            })
        })
        .collect()
}

/// Fact rows derived from a batch of change observations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FactConversion {
    pub rows: Vec<FactRow>,
    /// Events that are not connection transitions.
    pub skipped_events: Vec<StatusObservation>,
    /// Transition events missing a company mapping, platform or timestamp.
    pub incomplete: usize,
}

/// Joins observations to the company dimension and stamps each fact with the
/// observation's own creation time.
pub fn convert_to_fact_rows(
    observations: &[StatusObservation],
    dimension: &DimensionMapping,
) -> FactConversion {
    let mut conversion = FactConversion::default();
    for obs in observations {
        if obs.is_skipped_event() {
            conversion.skipped_events.push(obs.clone());
            continue;
        }
        let company_key = obs.company_id.and_then(|id| dimension.get(&id).copied());
        let status = obs.event_name.as_ref().and_then(EventName::connection_status);
        match (company_key, obs.platform, obs.observed_at, status) {
            (Some(company_key), Some(platform), Some(at), Some(status)) => {
                conversion.rows.push(FactRow {
                    entity_key: company_key,
                    category: platform,
                    status,
                    as_of: StampKey::from_datetime(at),
                });
            }
            _ => conversion.incomplete += 1,
        }
    }
    conversion
}

/// Distinct `(company_key, platform)` pairs observed in a snapshot.
///
/// Soft-deleted items (`is_delete = true`) are not connections.
pub fn observed_pairs(
    observations: &[StatusObservation],
    dimension: &DimensionMapping,
) -> BTreeSet<(i64, Platform)> {
    observations
        .iter()
        .filter(|obs| obs.is_delete != Some(true))
        .filter_map(|obs| {
            let key = dimension.get(&obs.company_id?)?;
            Some((*key, obs.platform?))
        })
        .collect()
}

/// One CRM company update: `properties` maps platform property -> "yes"/"no".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmUpdate {
    pub id: i64,
    pub properties: BTreeMap<String, String>,
}

/// Observations split by why they can or cannot reach the CRM.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrmPreparation {
    pub events: Vec<StatusEvent<i64>>,
    pub missing_crm_id: Vec<Option<i64>>,
    pub unsupported_platform: Vec<StatusObservation>,
    pub skipped_events: Vec<StatusObservation>,
}

/// Attaches CRM ids, then keeps supported platforms, then transition events.
pub fn prepare_crm_events(
    observations: &[StatusObservation],
    crm_ids: &BTreeMap<i64, i64>,
) -> CrmPreparation {
    let mut prep = CrmPreparation::default();
    for obs in observations {
        let Some(crm_id) = obs.company_id.and_then(|id| crm_ids.get(&id).copied()) else {
            prep.missing_crm_id.push(obs.company_id);
            continue;
        };
        let Some(platform) = obs.platform else {
            prep.unsupported_platform.push(obs.clone());
            continue;
        };
        match &obs.event_name {
            Some(name) if name.connection_status().is_some() => prep.events.push(StatusEvent {
                entity_key: crm_id,
                category: platform,
                timestamp: obs.observed_at,
                event_name: name.clone(),
            }),
            _ => prep.skipped_events.push(obs.clone()),
        }
    }
    prep
}

/// One update per CRM id, carrying every platform status aggregated for it.
pub fn build_crm_updates(latest: &BTreeMap<(i64, Platform), bool>) -> Vec<CrmUpdate> {
    let mut grouped: BTreeMap<i64, BTreeMap<String, String>> = BTreeMap::new();
    for ((id, platform), connected) in latest {
        let value = if *connected { "yes" } else { "no" };
        grouped
            .entry(*id)
            .or_default()
            .insert(platform.crm_property().to_string(), value.to_string());
    }
    grouped
        .into_iter()
        .map(|(id, properties)| CrmUpdate { id, properties })
        .collect()
}

/// Splits updates into request-sized groups; a size of 0 is treated as 1.
pub fn batch_updates(updates: &[CrmUpdate], size: usize) -> Vec<&[CrmUpdate]> {
    updates.chunks(size.max(1)).collect()
}

pub fn to_json_lines(updates: &[CrmUpdate]) -> serde_json::Result<String> {
    let lines = updates
        .iter()
        .map(serde_json::to_string)
        .collect::<serde_json::Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2022, 3, 8, hour, 0, 0).single()
    }

    fn stamp() -> StampKey {
        StampKey::new(20220308, 90508)
    }

    fn event(key: &'static str, category: Platform, hour: u32, name: EventName) -> StatusEvent<&'static str> {
        StatusEvent {
            entity_key: key,
            category,
            timestamp: at(hour),
            event_name: name,
        }
    }

    fn obs(company: i64, platform: Option<Platform>, name: &str, hour: u32) -> StatusObservation {
        StatusObservation {
            event_id: Some(format!("{company}-{hour}")),
            company_id: Some(company),
            platform,
            event_name: Some(EventName::parse(name)),
            observed_at: at(hour),
            is_delete: None,
        }
    }

    #[test]
    fn new_entities_are_the_unmapped_keys() {
        let mut known: BTreeMap<i64, i64> = BTreeMap::from([(1000, 1)]);
        let incoming = [1000, 1001];
        assert_eq!(find_new_entities(&incoming, &known), BTreeSet::from([1001]));

        known.insert(1001, 2);
        assert!(find_new_entities(&incoming, &known).is_empty());
        assert!(find_new_entities(&[], &known).is_empty());
    }

    #[test]
    fn latest_status_is_by_time_not_input_order() {
        let events = vec![
            event("A", Platform::Lazada, 12, EventName::Insert),
            event("A", Platform::Lazada, 10, EventName::Remove),
            event("A", Platform::Lazada, 11, EventName::Insert),
        ];
        let latest = aggregate_latest(&events);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[&("A", Platform::Lazada)], true);

        let events = vec![
            event("A", Platform::Lazada, 10, EventName::Insert),
            event("A", Platform::Lazada, 11, EventName::Remove),
        ];
        assert_eq!(aggregate_latest(&events)[&("A", Platform::Lazada)], false);
    }

    #[test]
    fn latest_status_groups_by_entity_and_platform() {
        let events = vec![
            event("A", Platform::Lazada, 10, EventName::Insert),
            event("A", Platform::Shopee, 10, EventName::Remove),
            event("B", Platform::Lazada, 9, EventName::Remove),
        ];
        let latest = aggregate_latest(&events);
        assert_eq!(latest.len(), 3);
        assert!(latest[&("A", Platform::Lazada)]);
        assert!(!latest[&("A", Platform::Shopee)]);
        assert!(!latest[&("B", Platform::Lazada)]);
        assert!(aggregate_latest::<&str>(&[]).is_empty());
    }

    #[test]
    fn equal_timestamps_take_the_later_input() {
        let events = vec![
            event("A", Platform::Lazada, 10, EventName::Insert),
            event("A", Platform::Lazada, 10, EventName::Remove),
        ];
        assert!(!aggregate_latest(&events)[&("A", Platform::Lazada)]);

        let mut undated = event("A", Platform::Lazada, 0, EventName::Remove);
        undated.timestamp = None;
        let events = vec![event("A", Platform::Lazada, 10, EventName::Insert), undated];
        assert!(aggregate_latest(&events)[&("A", Platform::Lazada)]);
    }

    #[test]
    fn delta_disconnects_pairs_missing_from_snapshot() {
        let current = vec![ConnectionStatus {
            entity_key: "A",
            category: Platform::Lazada,
            status: true,
            as_of: StampKey::new(20220301, 0),
        }];
        let result = reconcile_delta(&current, &BTreeSet::new(), stamp());
        assert!(result.connected.is_empty());
        assert_eq!(
            result.disconnected,
            vec![ConnectionStatus {
                entity_key: "A",
                category: Platform::Lazada,
                status: false,
                as_of: stamp(),
            }]
        );
    }

    #[test]
    fn delta_reconnects_every_observed_pair() {
        let current = vec![
            ConnectionStatus {
                entity_key: "A",
                category: Platform::Lazada,
                status: true,
                as_of: StampKey::new(20220301, 0),
            },
            ConnectionStatus {
                entity_key: "B",
                category: Platform::Shopee,
                status: false,
                as_of: StampKey::new(20220301, 0),
            },
        ];
        let incoming = BTreeSet::from([("A", Platform::Lazada), ("C", Platform::Shopee)]);
        let rows = reconcile_delta(&current, &incoming, stamp()).into_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status && r.as_of == stamp()));
    }

    #[test]
    fn snapshot_covers_the_full_cross_product() {
        let entities = BTreeSet::from(["A", "B"]);
        let incoming = BTreeSet::from([("A", Platform::Lazada)]);
        let rows = reconcile_snapshot(
            &entities,
            &[Platform::Lazada, Platform::Shopee],
            &incoming,
            stamp(),
        );
        assert_eq!(rows.len(), 4);
        let connected: Vec<_> = rows.iter().filter(|r| r.status).collect();
        assert_eq!(connected.len(), 1);
        assert_eq!((connected[0].entity_key, connected[0].category), ("A", Platform::Lazada));
        assert!(rows.iter().all(|r| r.as_of == stamp()));
    }

    #[test]
    fn snapshot_replay_is_identical() {
        let entities = BTreeSet::from([1, 2, 3]);
        let incoming = BTreeSet::from([(2, Platform::Shopee)]);
        let first = reconcile_snapshot(&entities, &Platform::WITH_SOURCE_CODE, &incoming, stamp());
        let second = reconcile_snapshot(&entities, &Platform::WITH_SOURCE_CODE, &incoming, stamp());
        assert_eq!(first, second);
    }

    #[test]
    fn delta_replay_appends_duplicate_connections() {
        let incoming = BTreeSet::from([("A", Platform::Lazada)]);
        let first = reconcile_delta(&[], &incoming, stamp()).into_rows();
        let current = first.clone();
        let second = reconcile_delta(&current, &incoming, stamp()).into_rows();
        assert_eq!(first, second);

        let mut fact_table = first;
        fact_table.extend(second);
        assert_eq!(fact_table.len(), 2);
        assert!(fact_table.iter().all(|r| r.status && r.entity_key == "A"));
    }

    #[test]
    fn soft_deleted_items_are_not_observed() {
        let dimension = DimensionMapping::from([(7, 1), (8, 2)]);
        let observations = vec![
            StatusObservation {
                company_id: Some(7),
                platform: Some(Platform::Lazada),
                is_delete: Some(true),
                ..StatusObservation::default()
            },
            StatusObservation {
                company_id: Some(8),
                platform: Some(Platform::Shopee),
                is_delete: Some(false),
                ..StatusObservation::default()
            },
            StatusObservation {
                company_id: Some(8),
                platform: Some(Platform::Lazada),
                ..StatusObservation::default()
            },
        ];
        let pairs = observed_pairs(&observations, &dimension);
        assert_eq!(pairs, BTreeSet::from([(2, Platform::Lazada), (2, Platform::Shopee)]));
    }

    #[test]
    fn fact_conversion_uses_each_event_time() {
        let dimension = DimensionMapping::from([(1000, 1), (1001, 2), (1002, 3)]);
        let observations = vec![
            StatusObservation {
                observed_at: Utc.with_ymd_and_hms(2022, 3, 1, 9, 15, 0).single(),
                ..obs(1000, Some(Platform::Lazada), "INSERT", 0)
            },
            StatusObservation {
                observed_at: Utc.with_ymd_and_hms(2022, 3, 15, 14, 30, 0).single(),
                ..obs(1001, Some(Platform::Shopee), "MODIFY", 0)
            },
            StatusObservation {
                observed_at: Utc.with_ymd_and_hms(2022, 3, 31, 8, 45, 0).single(),
                ..obs(1002, Some(Platform::Shopee), "REMOVE", 0)
            },
        ];
        let conversion = convert_to_fact_rows(&observations, &dimension);
        assert_eq!(
            conversion.rows,
            vec![
                FactRow {
                    entity_key: 1,
                    category: Platform::Lazada,
                    status: true,
                    as_of: StampKey::new(20220301, 91500),
                },
                FactRow {
                    entity_key: 3,
                    category: Platform::Shopee,
                    status: false,
                    as_of: StampKey::new(20220331, 84500),
                },
            ]
        );
        assert_eq!(conversion.skipped_events.len(), 1);
        assert_eq!(conversion.incomplete, 0);
    }

    #[test]
    fn fact_conversion_drops_unmapped_rows() {
        let dimension = DimensionMapping::from([(1000, 1)]);
        let observations = vec![
            obs(1000, None, "INSERT", 1),
            obs(4242, Some(Platform::Lazada), "INSERT", 1),
        ];
        let conversion = convert_to_fact_rows(&observations, &dimension);
        assert!(conversion.rows.is_empty());
        assert_eq!(conversion.incomplete, 2);
    }

    #[test]
    fn crm_preparation_reports_each_rejection() {
        let crm_ids = BTreeMap::from([(1000, 501), (1001, 502)]);
        let observations = vec![
            obs(1000, Some(Platform::Lazada), "INSERT", 1),
            obs(1000, None, "INSERT", 2),
            obs(1001, Some(Platform::Shopee), "MODIFY", 3),
            obs(9999, Some(Platform::Shopee), "INSERT", 4),
        ];
        let prep = prepare_crm_events(&observations, &crm_ids);
        assert_eq!(prep.events.len(), 1);
        assert_eq!(prep.events[0].entity_key, 501);
        assert_eq!(prep.unsupported_platform.len(), 1);
        assert_eq!(prep.skipped_events.len(), 1);
        assert_eq!(prep.missing_crm_id, vec![Some(9999)]);
    }

    #[test]
    fn crm_updates_group_platforms_per_company() {
        let latest = BTreeMap::from([
            ((501, Platform::Lazada), true),
            ((501, Platform::Shopee), false),
            ((502, Platform::KCash), true),
        ]);
        let updates = build_crm_updates(&latest);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].properties["lazada_api"], "yes");
        assert_eq!(updates[0].properties["shopee_api"], "no");
        assert_eq!(updates[1].properties["k_cash_connect_api"], "yes");

        let lines = to_json_lines(&updates).unwrap();
        assert_eq!(
            lines.lines().next().unwrap(),
            r#"{"id":501,"properties":{"lazada_api":"yes","shopee_api":"no"}}"#
        );
    }

    #[test]
    fn batches_respect_requested_size() {
        let updates: Vec<CrmUpdate> = (0..5)
            .map(|id| CrmUpdate {
                id,
                properties: BTreeMap::new(),
            })
            .collect();
        assert_eq!(batch_updates(&updates, 2).len(), 3);
        assert_eq!(batch_updates(&updates, 0).len(), 5);
        assert!(batch_updates(&[], 10).is_empty());
    }
}
