//! Store invariants across operation sequences, plus the boundary
//! behaviours around priorities, timestamps, and awkward value bytes.

use fluid_settings::core::schema::SchemaEntry;
use fluid_settings::{
    GetResult, Lookup, Priority, Schema, SetResult, SettingName, SettingStore, Timestamp,
};

fn name(s: &str) -> SettingName {
    SettingName::parse(s).unwrap()
}

fn prio(p: i64) -> Priority {
    Priority::new(p).unwrap()
}

fn ts(offset: i64) -> Timestamp {
    Timestamp::from_nanos(Timestamp::EPOCH.as_nanos() + offset).unwrap()
}

fn plain() -> SchemaEntry {
    SchemaEntry {
        default: None,
        validator: None,
        help: String::new(),
    }
}

fn schema() -> Schema {
    Schema::from_entries([
        (name("svc::a"), plain()),
        (name("svc::b"), plain()),
        (
            name("svc::port"),
            SchemaEntry {
                default: Some("8080".into()),
                validator: Some(fluid_settings::core::Validator::parse("integer").unwrap()),
                help: "listen port".into(),
            },
        ),
    ])
}

#[test]
fn boundary_priorities() {
    let schema = schema();
    let mut store = SettingStore::new();

    for p in [0, 50, 99] {
        assert_eq!(
            store.set(&schema, &name("svc::a"), &format!("v{p}"), prio(p), ts(p)),
            if p == 0 {
                SetResult::New
            } else {
                SetResult::NewPriority
            }
        );
    }

    // out-of-range priorities cannot even be constructed
    assert!(Priority::new(-1).is_err());
    assert!(Priority::new(100).is_err());

    // -1 is only meaningful as the reader sentinel
    assert_eq!(Lookup::from_wire(-1).unwrap(), Lookup::Highest);
    assert_eq!(
        store.get(&schema, &name("svc::a"), Lookup::Highest),
        GetResult::Success("v99".into())
    );
}

#[test]
fn boundary_timestamps() {
    let schema = schema();
    let mut store = SettingStore::new();

    // exactly at the epoch is accepted, just before is not constructible
    assert!(Timestamp::from_nanos(Timestamp::EPOCH.as_nanos() - 1).is_err());
    assert_eq!(
        store.set(
            &schema,
            &name("svc::a"),
            "at-epoch",
            prio(50),
            Timestamp::EPOCH,
        ),
        SetResult::New
    );
    assert_eq!(
        store.set(&schema, &name("svc::a"), "after", prio(50), ts(1)),
        SetResult::Changed
    );
}

#[test]
fn awkward_value_bytes_survive_serialization() {
    let schema = schema();
    let mut store = SettingStore::new();
    let tricky = "a|b\\c\nd\re,f";
    store.set(&schema, &name("svc::a"), tricky, prio(50), ts(1));

    let blob = store.serialize(&name("svc::a")).unwrap();
    let mut other = SettingStore::new();
    other.deserialize(&schema, &name("svc::a"), &blob);

    assert_eq!(
        other.get(&schema, &name("svc::a"), Lookup::Highest),
        GetResult::Success(tricky.into())
    );
}

#[test]
fn no_duplicate_priorities_after_any_sequence() {
    let schema = schema();
    let mut store = SettingStore::new();

    // hammer one slot from several "writers"
    for i in 0..20i64 {
        store.set(
            &schema,
            &name("svc::a"),
            &format!("w{i}"),
            prio(i % 3 * 10),
            ts(i),
        );
    }

    let records = store.records(&name("svc::a")).unwrap();
    assert_eq!(records.len(), 3);
    // BTreeMap keys are unique by construction; check the records agree
    for (priority, record) in records {
        assert_eq!(*priority, record.priority);
    }
}

#[test]
fn timestamp_monotonicity_per_slot() {
    let schema = schema();
    let mut store = SettingStore::new();

    let mut last = None;
    for t in [5i64, 3, 8, 8, 1, 9] {
        store.set(&schema, &name("svc::a"), &format!("t{t}"), prio(50), ts(t));
        let stored = store.records(&name("svc::a")).unwrap()[&prio(50)].timestamp;
        if let Some(previous) = last {
            assert!(stored >= previous, "stored timestamp never decreases");
        }
        last = Some(stored);
    }
    assert_eq!(last, Some(ts(9)));
}

#[test]
fn setting_present_iff_records_exist() {
    let schema = schema();
    let mut store = SettingStore::new();

    store.set(&schema, &name("svc::a"), "x", prio(10), ts(1));
    store.set(&schema, &name("svc::a"), "y", prio(20), ts(2));
    store.set(&schema, &name("svc::b"), "z", prio(10), ts(3));
    assert_eq!(store.len(), 2);

    store.reset(&name("svc::a"), prio(10));
    assert_eq!(store.len(), 2, "one record left");
    store.reset(&name("svc::a"), prio(20));
    assert_eq!(store.len(), 1, "svc::a is gone");
    assert!(store.names().all(|n| n == &name("svc::b")));
}

#[test]
fn default_then_override_then_reset() {
    let schema = schema();
    let mut store = SettingStore::new();
    let port = name("svc::port");

    assert_eq!(
        store.get(&schema, &port, Lookup::Highest),
        GetResult::Default("8080".into())
    );
    assert_eq!(
        store.set(&schema, &port, "9090", prio(50), ts(1)),
        SetResult::New
    );
    assert_eq!(
        store.get(&schema, &port, Lookup::Highest),
        GetResult::Success("9090".into())
    );

    assert!(store.reset(&port, prio(50)));
    assert_eq!(
        store.get(&schema, &port, Lookup::Highest),
        GetResult::Default("8080".into())
    );
}

#[test]
fn dormant_schema_answers_unknown_everywhere() {
    let schema = Schema::default();
    let mut store = SettingStore::new();

    assert!(schema.is_empty());
    assert_eq!(
        store.get(&schema, &name("svc::a"), Lookup::Highest),
        GetResult::Unknown
    );
    assert_eq!(
        store.set(&schema, &name("svc::a"), "x", prio(50), ts(1)),
        SetResult::Unknown
    );
    assert_eq!(schema.list_of_options(), "");
}
