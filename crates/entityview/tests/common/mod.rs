//! Shared fixtures for the integration tests: a recording in-memory
//! connection and a document/person view model.
#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use entityview::{
    AttributeDecl, CloneEqType, CollectionKind, CollectionTable, Connection, Cx, Dialect,
    ElementType, EntityDescriptor, Error, Outcome, PluralCollection, Row, StaticMetamodel,
    UserValue, Value, ViewInstance, ViewMetamodel, ViewType,
};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
    }
}

/// Run a future to completion on a fresh single-threaded runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

// ============================================================================
// Mock connection
// ============================================================================

#[derive(Debug, Default)]
pub struct MockState {
    /// Canned rows per table, filtered on the first WHERE column.
    pub tables: HashMap<String, Vec<Row>>,
    /// Every statement issued, in order.
    pub executed: Vec<(String, Vec<Value>)>,
    /// Rows affected reported for every UPDATE/INSERT/DELETE.
    pub affected: Option<u64>,
    /// Statements containing this text fail.
    pub fail_on: Option<String>,
}

impl MockState {
    pub fn sql(&self) -> Vec<String> {
        self.executed.iter().map(|(sql, _)| sql.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    pub state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self {
            state,
            dialect: Dialect::Postgres,
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn sql(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").sql()
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub fn clear(&self) {
        self.state.lock().expect("lock poisoned").executed.clear();
    }

    /// Record a statement and fail it when it matches `fail_on`.
    fn record(&self, sql: &str, params: &[Value]) -> Result<(), Error> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.executed.push((sql.to_string(), params.to_vec()));
        match &guard.fail_on {
            Some(text) if sql.contains(text.as_str()) => {
                Err(Error::Custom(format!("mock failure on: {sql}")))
            }
            _ => Ok(()),
        }
    }
}

/// Identifier following `keyword` in rendered SQL, for either quoting style.
fn identifier_after<'s>(sql: &'s str, keyword: &str) -> Option<&'s str> {
    let start = sql.find(keyword)? + keyword.len();
    let rest = &sql[start..];
    let quote = rest.chars().next()?;
    let rest = &rest[quote.len_utf8()..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Err(e) => Outcome::Err(e),
            Ok(()) => {
                let guard = self.state.lock().expect("lock poisoned");
                let table = identifier_after(sql, "FROM ").unwrap_or_default();
                let filter_column = identifier_after(sql, "WHERE ");
                let rows = guard
                    .tables
                    .get(table)
                    .map(|rows| {
                        rows.iter()
                            .filter(|row| match (filter_column, params.first()) {
                                (Some(column), Some(value)) => row
                                    .get_by_name(column)
                                    .is_some_and(|v| v.same_as(value)),
                                _ => true,
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Outcome::Ok(rows)
            }
        };
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Err(e) => Outcome::Err(e),
            Ok(()) => Outcome::Ok(self.state.lock().expect("lock poisoned").affected.unwrap_or(1)),
        };
        async move { outcome }
    }
}

// ============================================================================
// View model
// ============================================================================

/// Mutable user value stored as comma separated hits.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub hits: Vec<i64>,
}

impl UserValue for Counter {
    fn type_name(&self) -> &str {
        "counter"
    }

    fn to_value(&self) -> Value {
        Value::Text(
            self.hits
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    fn clone_box(&self) -> Box<dyn UserValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn decode_counter(value: &Value) -> Option<Counter> {
    let hits = value
        .as_str()?
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<i64>, _>>()
        .ok()?;
    Some(Counter { hits })
}

pub fn entities() -> Arc<StaticMetamodel> {
    Arc::new(
        StaticMetamodel::builder()
            .entity(EntityDescriptor::new("Document", "documents", "id").versioned("version"))
            .column("name", "name")
            .column("address.street", "street")
            .column("address.city", "city")
            .column("counter", "counter")
            .column("owner", "owner_id")
            .collection(
                "tags",
                CollectionTable::new("document_tags", "document_id").element_column("tag"),
            )
            .collection(
                "contacts",
                CollectionTable::new("document_contacts", "document_id")
                    .key_column("kind")
                    .element_column("contact"),
            )
            .entity(EntityDescriptor::new("Person", "people", "id"))
            .column("name", "full_name")
            .column("friend", "friend_id")
            .entity(EntityDescriptor::new("Board", "boards", "id"))
            .collection(
                "tallies",
                CollectionTable::new("board_tallies", "board_id").element_column("tally"),
            )
            .entity(EntityDescriptor::new("Team", "teams", "id").versioned("version"))
            .column("name", "name")
            .column("captain", "captain_id")
            .collection(
                "members",
                CollectionTable::new("team_members", "team_id").element_column("member_id"),
            )
            .build(),
    )
}

fn view_types() -> Vec<ViewType> {
    vec![
        ViewType::builder("AddressView")
            .basic("street")
            .basic("city")
            .build(),
        ViewType::builder("PersonView")
            .entity("Person")
            .id("id")
            .creatable()
            .basic("name")
            .to_one("friend", "PersonView")
            .build(),
        ViewType::builder("DocView")
            .entity("Document")
            .id("id")
            .version("version")
            .basic("name")
            .embeddable("address", "AddressView")
            .user("counter", "counter")
            .to_one("owner", "PersonView")
            .set("tags", ElementType::basic())
            .map("contacts", ElementType::basic(), ElementType::basic())
            .build(),
        ViewType::builder("BoardView")
            .entity("Board")
            .id("id")
            .set("tallies", ElementType::user("counter"))
            .build(),
        ViewType::builder("TeamView")
            .entity("Team")
            .id("id")
            .version("version")
            .creatable()
            .basic("name")
            .attribute(AttributeDecl::to_one("captain", "PersonView").orphan_removal())
            .attribute(
                AttributeDecl::collection(
                    "members",
                    ElementType::view("PersonView"),
                    CollectionKind::Set,
                )
                .orphan_removal(),
            )
            .build(),
    ]
}

/// Document model with the counter user type registered.
pub fn metamodel() -> Arc<ViewMetamodel> {
    let mut builder = ViewMetamodel::builder()
        .user_type(CloneEqType::<Counter>::new("counter").with_decoder(decode_counter));
    for view_type in view_types() {
        builder = builder.register(view_type);
    }
    Arc::new(builder.build(entities()).expect("valid view model"))
}

/// Document model whose counter type is not registered.
pub fn unregistered_metamodel() -> Arc<ViewMetamodel> {
    let mut builder = ViewMetamodel::builder();
    for view_type in view_types() {
        builder = builder.register(view_type);
    }
    Arc::new(builder.build(entities()).expect("valid view model"))
}

/// Stored person view, as the fetcher would build it.
pub fn person(meta: &ViewMetamodel, id: i64, name: &str) -> ViewInstance {
    let view_type = meta.view_type("PersonView").expect("registered");
    ViewInstance::builder(Arc::clone(view_type))
        .id(id)
        .value("name", name)
        .build()
        .expect("valid person")
}

/// Stored team 10 at version 1, captained by person 7 with member 8.
pub fn loaded_team(meta: &ViewMetamodel) -> ViewInstance {
    let view_type = meta.view_type("TeamView").expect("registered");
    ViewInstance::builder(Arc::clone(view_type))
        .id(10_i64)
        .version(1)
        .value("name", "Red")
        .value("captain", person(meta, 7, "Ann"))
        .value(
            "members",
            PluralCollection::from_elements(CollectionKind::Set, [person(meta, 8, "Bo")]),
        )
        .build()
        .expect("valid team")
}

fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Stored state: document 1 (version 1) tagged a and b, owned by person 7,
/// and board 4 holding one tally.
pub fn seeded_state() -> Arc<Mutex<MockState>> {
    let mut state = MockState::default();
    state.tables.insert(
        "documents".to_string(),
        vec![row(
            &["id", "version", "name", "street", "city", "counter", "owner_id"],
            vec![
                Value::BigInt(1),
                Value::BigInt(1),
                text("Draft"),
                text("Main"),
                text("Springfield"),
                text("1,2"),
                Value::BigInt(7),
            ],
        )],
    );
    state.tables.insert(
        "document_tags".to_string(),
        vec![
            row(&["document_id", "tag"], vec![Value::BigInt(1), text("a")]),
            row(&["document_id", "tag"], vec![Value::BigInt(1), text("b")]),
        ],
    );
    state.tables.insert(
        "document_contacts".to_string(),
        vec![
            row(
                &["document_id", "kind", "contact"],
                vec![Value::BigInt(1), text("email"), text("a@x")],
            ),
            row(
                &["document_id", "kind", "contact"],
                vec![Value::BigInt(1), text("phone"), text("555")],
            ),
        ],
    );
    state.tables.insert(
        "people".to_string(),
        vec![row(
            &["id", "full_name", "friend_id"],
            vec![Value::BigInt(7), text("Ann"), Value::Null],
        )],
    );
    state.tables.insert(
        "board_tallies".to_string(),
        vec![row(&["board_id", "tally"], vec![Value::BigInt(4), text("1")])],
    );
    Arc::new(Mutex::new(state))
}
