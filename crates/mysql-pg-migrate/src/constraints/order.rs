//! Foreign key dependency order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::TableDescriptor;

/// Order in which tables get their foreign keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FkOrder {
    /// Tables whose references all come earlier in this list.
    pub ordered: Vec<String>,
    /// Tables on (or behind) a reference cycle, handled in a second pass.
    pub deferred: Vec<String>,
}

/// Topologically order tables so a table comes after every table it references.
///
/// Self references and references to tables outside the set are ignored.
/// Ties are broken by name, so the order is deterministic.
pub fn fk_order(tables: &[TableDescriptor]) -> FkOrder {
    let names: BTreeSet<&str> = tables.iter().map(|t| t.source_name.as_str()).collect();

    // referenced table -> tables that reference it
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();

    for table in tables {
        let from = table.source_name.as_str();
        let refs: BTreeSet<&str> = table
            .foreign_keys
            .iter()
            .map(|fk| fk.ref_table.as_str())
            .filter(|r| *r != from && names.contains(r))
            .collect();

        for r in refs {
            if dependents.entry(r).or_default().insert(from) {
                *in_degree.entry(from).or_default() += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut ordered = Vec::with_capacity(names.len());

    while let Some(name) = queue.pop_front() {
        ordered.push(name.to_string());
        let Some(next) = dependents.get(name) else {
            continue;
        };
        let mut ready = Vec::new();
        for dep in next {
            if let Some(d) = in_degree.get_mut(dep) {
                *d -= 1;
                if *d == 0 {
                    ready.push(*dep);
                }
            }
        }
        queue.extend(ready);
    }

    let done: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
    let deferred = names
        .iter()
        .filter(|n| !done.contains(*n))
        .map(|n| n.to_string())
        .collect();

    FkOrder { ordered, deferred }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ForeignKeyDescriptor, SourceColumn, SourceTable};
    use crate::structure::resolve_table;

    fn table(name: &str, refs: &[&str]) -> TableDescriptor {
        resolve_table(SourceTable {
            name: name.into(),
            columns: vec![SourceColumn::new("id", "int", "int")],
            indexes: vec![],
            foreign_keys: refs
                .iter()
                .map(|r| ForeignKeyDescriptor::new(format!("fk_{}_{}", name, r), ["id"], *r, ["id"]))
                .collect(),
            row_estimate: 0,
            avg_row_width: 0,
            comment: None,
        })
        .unwrap()
    }

    fn position(order: &FkOrder, name: &str) -> usize {
        order.ordered.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_referenced_tables_come_first() {
        let order = fk_order(&[
            table("order_items", &["orders", "products"]),
            table("orders", &["customers"]),
            table("products", &[]),
            table("customers", &[]),
        ]);
        assert!(order.deferred.is_empty());
        assert!(position(&order, "customers") < position(&order, "orders"));
        assert!(position(&order, "orders") < position(&order, "order_items"));
        assert!(position(&order, "products") < position(&order, "order_items"));
    }

    #[test]
    fn test_self_and_external_references_ignored() {
        let order = fk_order(&[table("employees", &["employees", "elsewhere"])]);
        assert_eq!(order.ordered, vec!["employees".to_string()]);
        assert!(order.deferred.is_empty());
    }

    #[test]
    fn test_cycle_is_deferred_not_dropped() {
        let order = fk_order(&[
            table("a", &["b"]),
            table("b", &["a"]),
            table("c", &[]),
        ]);
        assert_eq!(order.ordered, vec!["c".to_string()]);
        assert_eq!(order.deferred, vec!["a".to_string(), "b".to_string()]);
    }
}
