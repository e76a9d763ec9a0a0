use std::cmp::Ordering;

use crate::{
    document::catalog::CollectionMeta,
    document::record::Cell,
    query::executor::Plan,
    query::expr::{Expr, Op},
};

/// Turn a predicate tree into a physical plan.
///
/// Policy: split the predicate into conjuncts. An equality on an
/// indexed field becomes an index seek; a starts-with becomes an index
/// prefix walk; ordering comparisons on one indexed field merge into a
/// single index range. Conjuncts the access path does not absorb stay
/// behind as a residual filter. Anything else is a collection scan
/// with the predicate pushed down. A requested sort rides on the index
/// when the access path already orders by that field; otherwise an
/// in-memory sort operator goes on top.
pub fn plan_query(
    expr: &Expr,
    meta: Option<&CollectionMeta>,
    sort: Option<(&str, bool)>,
) -> Plan {
    let access = meta.and_then(|meta| pick_access_path(expr, meta));

    let mut plan;
    let mut ordered_by: Option<(String, bool)> = None;

    match access {
        Some(access) => {
            let ascending = match sort {
                Some((field, ascending)) if field == access.field => ascending,
                _ => true,
            };
            ordered_by = Some((access.field, ascending));
            plan = set_direction(access.plan, ascending);
            if !access.full_cover {
                plan = Plan::Filter {
                    input: Box::new(plan),
                    predicate: expr.clone(),
                };
            }
        }
        None => {
            // a sort on an indexed field turns a bare scan into a full
            // ordered index walk
            if let (Some((field, ascending)), Some(meta)) = (sort, meta) {
                if meta.index(field).is_some() {
                    plan = Plan::IndexRange {
                        field: field.to_string(),
                        lo: None,
                        hi: None,
                        ascending,
                    };
                    if !matches!(expr, Expr::True) {
                        plan = Plan::Filter {
                            input: Box::new(plan),
                            predicate: expr.clone(),
                        };
                    }
                    return plan;
                }
            }
            plan = Plan::CollectionScan {
                predicate: if matches!(expr, Expr::True) {
                    None
                } else {
                    Some(expr.clone())
                },
            };
        }
    }

    if let Some((field, ascending)) = sort {
        let already_ordered = ordered_by
            .as_ref()
            .map(|(by, asc)| by == field && *asc == ascending)
            .unwrap_or(false);
        if !already_ordered {
            plan = Plan::Sort {
                input: Box::new(plan),
                field: field.to_string(),
                ascending,
            };
        }
    }
    plan
}

struct AccessPath {
    plan: Plan,
    field: String,

    /// Whether the access path absorbs every conjunct, making a
    /// residual filter unnecessary.
    full_cover: bool,
}

fn conjuncts_of<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::And(a, b) => {
            conjuncts_of(a, out);
            conjuncts_of(b, out);
        }
        other => out.push(other),
    }
}

fn pick_access_path(expr: &Expr, meta: &CollectionMeta) -> Option<AccessPath> {
    let mut conjuncts = Vec::new();
    conjuncts_of(expr, &mut conjuncts);

    // an equality seek beats everything
    for conjunct in &conjuncts {
        if let Expr::Compare {
            field,
            op: Op::Equals,
            value,
        } = conjunct
        {
            if meta.index(field).is_some() {
                return Some(AccessPath {
                    plan: Plan::IndexSeek {
                        field: field.clone(),
                        value: value.clone(),
                    },
                    field: field.clone(),
                    full_cover: conjuncts.len() == 1,
                });
            }
        }
    }

    for conjunct in &conjuncts {
        if let Expr::Compare {
            field,
            op: Op::StartsWith,
            value: Cell::String(prefix),
        } = conjunct
        {
            if meta.index(field).is_some() {
                return Some(AccessPath {
                    plan: Plan::IndexPrefix {
                        field: field.clone(),
                        prefix: prefix.clone(),
                    },
                    field: field.clone(),
                    full_cover: conjuncts.len() == 1,
                });
            }
        }
    }

    // merge every ordering comparison on the first indexed field into
    // one range
    let range_field = conjuncts.iter().find_map(|conjunct| match conjunct {
        Expr::Compare { field, op, .. }
            if is_ordering(*op) && meta.index(field).is_some() =>
        {
            Some(field.clone())
        }
        _ => None,
    })?;

    let mut lo: Option<(Cell, bool)> = None;
    let mut hi: Option<(Cell, bool)> = None;
    let mut absorbed = 0;

    for conjunct in &conjuncts {
        if let Expr::Compare { field, op, value } = conjunct {
            if *field != range_field || !is_ordering(*op) {
                continue;
            }
            absorbed += 1;
            match op {
                Op::GreaterThan => tighten_lo(&mut lo, value.clone(), false),
                Op::GreaterThanOrEq => tighten_lo(&mut lo, value.clone(), true),
                Op::LessThan => tighten_hi(&mut hi, value.clone(), false),
                Op::LessThanOrEq => tighten_hi(&mut hi, value.clone(), true),
                _ => unreachable!(),
            }
        }
    }

    Some(AccessPath {
        plan: Plan::IndexRange {
            field: range_field.clone(),
            lo,
            hi,
            ascending: true,
        },
        field: range_field,
        full_cover: absorbed == conjuncts.len(),
    })
}

fn is_ordering(op: Op) -> bool {
    matches!(
        op,
        Op::GreaterThan | Op::GreaterThanOrEq | Op::LessThan | Op::LessThanOrEq
    )
}

fn tighten_lo(lo: &mut Option<(Cell, bool)>, value: Cell, inclusive: bool) {
    let replace = match lo {
        None => true,
        Some((current, current_inclusive)) => match value.partial_cmp(current) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => *current_inclusive && !inclusive,
            _ => false,
        },
    };
    if replace {
        *lo = Some((value, inclusive));
    }
}

fn tighten_hi(hi: &mut Option<(Cell, bool)>, value: Cell, inclusive: bool) {
    let replace = match hi {
        None => true,
        Some((current, current_inclusive)) => match value.partial_cmp(current) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => *current_inclusive && !inclusive,
            _ => false,
        },
    };
    if replace {
        *hi = Some((value, inclusive));
    }
}

fn set_direction(plan: Plan, ascending: bool) -> Plan {
    match plan {
        Plan::IndexRange { field, lo, hi, .. } => Plan::IndexRange {
            field,
            lo,
            hi,
            ascending,
        },
        other => other,
    }
}
