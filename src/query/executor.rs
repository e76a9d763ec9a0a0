use std::cmp::Ordering;

use crate::{
    btree::{key, BTree},
    document::{
        collection::Collection,
        record::{Cell, Record},
        DocId,
    },
    error::{ErrorKind, SmallError},
    query::{expr::Expr, plan::plan_query},
    transaction::Transaction,
};

/// A physical operator tree. Leaves access the collection (scan, index
/// seek/range/prefix); the rest shape the row stream.
#[derive(Debug, Clone)]
pub enum Plan {
    CollectionScan {
        predicate: Option<Expr>,
    },
    IndexSeek {
        field: String,
        value: Cell,
    },
    IndexRange {
        field: String,
        lo: Option<(Cell, bool)>,
        hi: Option<(Cell, bool)>,
        ascending: bool,
    },
    IndexPrefix {
        field: String,
        prefix: String,
    },
    Filter {
        input: Box<Plan>,
        predicate: Expr,
    },
    Project {
        input: Box<Plan>,
        fields: Vec<String>,
    },
    Sort {
        input: Box<Plan>,
        field: String,
        ascending: bool,
    },
    Skip {
        input: Box<Plan>,
        count: usize,
    },
    Take {
        input: Box<Plan>,
        count: usize,
    },
}

pub type DocIter<'a> = Box<dyn Iterator<Item = Result<(DocId, Record), SmallError>> + 'a>;

/// Entries of the named index inside `[lo, hi)`, as document id bytes
/// in key order.
fn index_ids(
    collection: &Collection,
    tx: &Transaction,
    field: &str,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    ascending: bool,
) -> Result<Vec<Vec<u8>>, SmallError> {
    let meta = collection.meta(tx).ok_or_else(|| {
        SmallError::new(
            ErrorKind::NotFound,
            &format!("collection {} does not exist", collection.name()),
        )
    })?;
    let def = meta.index(field).ok_or_else(|| {
        SmallError::new(
            ErrorKind::NotFound,
            &format!("no index on {}.{}", collection.name(), field),
        )
    })?;

    let tree = BTree::index(def.root);
    let entries = tree.range(tx, lo.as_deref(), hi.as_deref(), ascending)?;
    Ok(entries.into_iter().map(|(_, value)| value).collect())
}

fn index_bounds(
    collection: &Collection,
    tx: &Transaction,
    field: &str,
    lo: &Option<(Cell, bool)>,
    hi: &Option<(Cell, bool)>,
) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), SmallError> {
    let unique = collection
        .meta(tx)
        .and_then(|meta| meta.index(field).map(|def| def.unique))
        .unwrap_or(false);
    let lo = lo
        .as_ref()
        .map(|(cell, inclusive)| key::lower_bound(cell, *inclusive, unique));
    let hi = hi
        .as_ref()
        .map(|(cell, inclusive)| key::upper_bound(cell, *inclusive, unique));
    Ok((lo, hi))
}

fn fetch_by_ids<'a>(
    collection: &Collection,
    tx: &'a Transaction,
    ids: Vec<Vec<u8>>,
) -> Result<DocIter<'a>, SmallError> {
    let kind = collection
        .meta(tx)
        .map(|meta| meta.id_kind)
        .ok_or_else(|| SmallError::new(ErrorKind::NotFound, "collection does not exist"))?;
    let collection = collection.clone();
    Ok(Box::new(ids.into_iter().map(move |id_bytes| {
        let id = DocId::from_bytes(kind, &id_bytes)?;
        match collection.find_by_id(tx, &id)? {
            Some(record) => Ok((id, record)),
            None => Err(SmallError::corruption(&format!(
                "index entry points at missing document {}",
                id
            ))),
        }
    })))
}

/// Instantiate a plan as a lazy row stream.
pub fn execute<'a>(
    plan: &Plan,
    collection: &Collection,
    tx: &'a Transaction,
) -> Result<DocIter<'a>, SmallError> {
    match plan {
        Plan::CollectionScan { predicate } => {
            let scan = collection.scan(tx)?;
            let predicate = predicate.clone();
            Ok(Box::new(scan.filter_map(move |item| match item {
                Err(e) => Some(Err(e)),
                Ok((id, payload)) => {
                    // push-down: judge the raw payload before decoding
                    if let Some(predicate) = &predicate {
                        match predicate.matches_raw(&payload) {
                            Err(e) => return Some(Err(e)),
                            Ok(false) => return None,
                            Ok(true) => {}
                        }
                    }
                    Some(Record::decode(&payload).map(|record| (id, record)))
                }
            })))
        }

        Plan::IndexSeek { field, value } => {
            let unique = collection
                .meta(tx)
                .and_then(|meta| meta.index(field).map(|def| def.unique))
                .unwrap_or(false);
            let (lo, hi) = key::eq_bounds(value, unique);
            let ids = index_ids(collection, tx, field, Some(lo), Some(hi), true)?;
            fetch_by_ids(collection, tx, ids)
        }

        Plan::IndexRange {
            field,
            lo,
            hi,
            ascending,
        } => {
            let (lo, hi) = index_bounds(collection, tx, field, lo, hi)?;
            let ids = index_ids(collection, tx, field, lo, hi, *ascending)?;
            fetch_by_ids(collection, tx, ids)
        }

        Plan::IndexPrefix { field, prefix } => {
            let (lo, hi) = key::prefix_bounds(prefix);
            let ids = index_ids(collection, tx, field, Some(lo), Some(hi), true)?;
            fetch_by_ids(collection, tx, ids)
        }

        Plan::Filter { input, predicate } => {
            let inner = execute(input, collection, tx)?;
            let predicate = predicate.clone();
            Ok(Box::new(inner.filter(move |item| match item {
                Err(_) => true,
                Ok((_, record)) => predicate.matches_record(record),
            })))
        }

        Plan::Project { input, fields } => {
            let inner = execute(input, collection, tx)?;
            let fields = fields.clone();
            Ok(Box::new(inner.map(move |item| {
                item.map(|(id, record)| {
                    let mut projected = Record::new();
                    for field in &fields {
                        if let Some(cell) = record.get(field) {
                            projected = projected.set(field, cell.clone());
                        }
                    }
                    (id, projected)
                })
            })))
        }

        Plan::Sort {
            input,
            field,
            ascending,
        } => {
            // a sort is a pipeline breaker: materialize, order by the
            // extracted key, re-emit
            let inner = execute(input, collection, tx)?;
            let mut rows = Vec::new();
            for item in inner {
                rows.push(item?);
            }
            let field = field.clone();
            rows.sort_by(|(_, a), (_, b)| {
                let ord = match (a.get(&field), b.get(&field)) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                };
                ord
            });
            if !ascending {
                rows.reverse();
            }
            Ok(Box::new(rows.into_iter().map(Ok)))
        }

        Plan::Skip { input, count } => {
            let inner = execute(input, collection, tx)?;
            Ok(Box::new(inner.skip(*count)))
        }

        Plan::Take { input, count } => {
            let inner = execute(input, collection, tx)?;
            Ok(Box::new(inner.take(*count)))
        }
    }
}

/// How many rows the plan is expected to produce; -1 when unknown.
pub fn estimate_cardinality(
    plan: &Plan,
    collection: &Collection,
    tx: &Transaction,
) -> Result<i64, SmallError> {
    match plan {
        Plan::CollectionScan { predicate: None } => Ok(collection.count(tx) as i64),
        Plan::CollectionScan { predicate: Some(_) } => Ok(-1),

        Plan::IndexSeek { field, value } => {
            let unique = collection
                .meta(tx)
                .and_then(|meta| meta.index(field).map(|def| def.unique))
                .unwrap_or(false);
            if unique {
                return Ok(1);
            }
            let (lo, hi) = key::eq_bounds(value, unique);
            Ok(index_ids(collection, tx, field, Some(lo), Some(hi), true)?.len() as i64)
        }

        Plan::IndexRange { field, lo, hi, .. } => {
            let (lo, hi) = index_bounds(collection, tx, field, lo, hi)?;
            Ok(index_ids(collection, tx, field, lo, hi, true)?.len() as i64)
        }

        Plan::IndexPrefix { field, prefix } => {
            let (lo, hi) = key::prefix_bounds(prefix);
            Ok(index_ids(collection, tx, field, Some(lo), Some(hi), true)?.len() as i64)
        }

        Plan::Filter { .. } => Ok(-1),
        Plan::Project { input, .. } => estimate_cardinality(input, collection, tx),
        Plan::Sort { input, .. } => estimate_cardinality(input, collection, tx),

        Plan::Skip { input, count } => {
            let inner = estimate_cardinality(input, collection, tx)?;
            if inner < 0 {
                Ok(-1)
            } else {
                Ok((inner - *count as i64).max(0))
            }
        }

        Plan::Take { input, count } => {
            let inner = estimate_cardinality(input, collection, tx)?;
            if inner < 0 {
                Ok(*count as i64)
            } else {
                Ok(inner.min(*count as i64))
            }
        }
    }
}

/// Fluent query surface over one collection.
pub struct Query {
    collection: Collection,
    filter: Expr,
    sort: Option<(String, bool)>,
    skip: usize,
    take: Option<usize>,
    projection: Option<Vec<String>>,
}

impl Query {
    pub(crate) fn new(collection: Collection) -> Self {
        Self {
            collection,
            filter: Expr::True,
            sort: None,
            skip: 0,
            take: None,
            projection: None,
        }
    }

    /// And-combine another predicate into the query.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = match self.filter {
            Expr::True => expr,
            current => current.and(expr),
        };
        self
    }

    pub fn sort(mut self, field: &str, ascending: bool) -> Self {
        self.sort = Some((field.to_string(), ascending));
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// The physical plan this query will run, for inspection.
    pub fn plan(&self, tx: &Transaction) -> Plan {
        let meta = self.collection.meta(tx);
        let sort = self
            .sort
            .as_ref()
            .map(|(field, ascending)| (field.as_str(), *ascending));
        let mut plan = plan_query(&self.filter, meta.as_ref(), sort);

        if self.skip > 0 {
            plan = Plan::Skip {
                input: Box::new(plan),
                count: self.skip,
            };
        }
        if let Some(count) = self.take {
            plan = Plan::Take {
                input: Box::new(plan),
                count,
            };
        }
        if let Some(fields) = &self.projection {
            plan = Plan::Project {
                input: Box::new(plan),
                fields: fields.clone(),
            };
        }
        plan
    }

    pub fn estimate_cardinality(&self, tx: &Transaction) -> Result<i64, SmallError> {
        estimate_cardinality(&self.plan(tx), &self.collection, tx)
    }

    pub fn run<'a>(&self, tx: &'a Transaction) -> Result<DocIter<'a>, SmallError> {
        execute(&self.plan(tx), &self.collection, tx)
    }

    pub fn to_vec(&self, tx: &Transaction) -> Result<Vec<(DocId, Record)>, SmallError> {
        let mut rows = Vec::new();
        for item in self.run(tx)? {
            rows.push(item?);
        }
        Ok(rows)
    }
}
