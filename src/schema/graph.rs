//! The per-datasource join graph.
//!
//! Nodes are tables; edges are legal single join steps, always in the
//! fan-out-safe direction:
//!
//! 1. child -> parent along the declared lineage (dimension lookup),
//! 2. sibling <-> sibling across declared links sharing a primary key,
//! 3. table -> dimension table whose primary key the table carries.
//!
//! A parent never joins downward to a child; picking up a child-grain
//! dimension would multiply metric rows.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::table::{Table, TableType};

/// Why an edge exists; descendent queries walk Parent edges only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Parent,
    Sibling,
    PkEquality,
}

#[derive(Debug, Clone)]
struct JoinEdge {
    kind: EdgeKind,
    join_fields: Vec<String>,
}

/// A table reachable in one join step.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborTable {
    pub table: String,
    pub join_fields: Vec<String>,
}

/// One join step between two tables on equal field values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinPart {
    pub from_table: String,
    pub to_table: String,
    pub join_fields: Vec<String>,
}

/// A chain (or merged tree) of join steps from a starting table.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Join {
    pub parts: Vec<JoinPart>,
}

impl Join {
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// All tables touched, starting table first.
    pub fn tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for part in &self.parts {
            if !out.contains(&part.from_table.as_str()) {
                out.push(&part.from_table);
            }
            if !out.contains(&part.to_table.as_str()) {
                out.push(&part.to_table);
            }
        }
        out
    }

    /// Merge another join's steps into this one, deduplicating shared
    /// steps; the parts stay in first-seen order.
    pub fn combine(mut self, other: &Join) -> Join {
        for part in &other.parts {
            if !self.parts.contains(part) {
                self.parts.push(part.clone());
            }
        }
        self
    }
}

/// A metric table plus the join chain sufficient to produce a grain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableSet {
    pub datasource: String,
    pub ds_table: String,
    pub join: Option<Join>,
    pub grain: BTreeSet<String>,
    pub target_fields: BTreeSet<String>,
}

impl TableSet {
    pub fn join_count(&self) -> usize {
        self.join.as_ref().map(|j| j.len()).unwrap_or(0)
    }

    /// All tables this set touches, metric table first.
    pub fn tables(&self) -> Vec<&str> {
        match &self.join {
            Some(join) if !join.is_empty() => join.tables(),
            _ => vec![self.ds_table.as_str()],
        }
    }
}

/// The join graph over one datasource's tables.
#[derive(Debug)]
pub struct SchemaGraph {
    graph: DiGraph<String, JoinEdge>,
    node_indices: BTreeMap<String, NodeIndex>,
}

impl SchemaGraph {
    /// Build the graph, validating lineage declarations: parents must
    /// exist with their primary key bound on the child, and siblings
    /// must share the declaring table's primary key.
    pub fn build(datasource: &str, tables: &BTreeMap<String, Table>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_indices = BTreeMap::new();

        for name in tables.keys() {
            let idx = graph.add_node(name.clone());
            node_indices.insert(name.clone(), idx);
        }

        for (name, table) in tables {
            let from_idx = node_indices[name];

            if let Some(parent_name) = &table.parent {
                let parent = tables.get(parent_name).ok_or_else(|| {
                    Error::ds_config(
                        datasource,
                        format!("table '{}' declares unknown parent '{}'", name, parent_name),
                    )
                })?;
                if parent.primary_key.is_empty() {
                    return Err(Error::ds_config(
                        datasource,
                        format!("parent table '{}' has no primary key", parent_name),
                    ));
                }
                for pk_field in &parent.primary_key {
                    if !table.has_field(pk_field) {
                        return Err(Error::ds_config(
                            datasource,
                            format!(
                                "table '{}' cannot join parent '{}': missing key field '{}'",
                                name, parent_name, pk_field
                            ),
                        ));
                    }
                }
                graph.add_edge(
                    from_idx,
                    node_indices[parent_name],
                    JoinEdge {
                        kind: EdgeKind::Parent,
                        join_fields: parent.primary_key.clone(),
                    },
                );
            }

            for sibling_name in &table.siblings {
                let sibling = tables.get(sibling_name).ok_or_else(|| {
                    Error::ds_config(
                        datasource,
                        format!("table '{}' declares unknown sibling '{}'", name, sibling_name),
                    )
                })?;
                if sibling.primary_key != table.primary_key {
                    return Err(Error::ds_config(
                        datasource,
                        format!(
                            "siblings '{}' and '{}' do not share a primary key",
                            name, sibling_name
                        ),
                    ));
                }
                graph.add_edge(
                    from_idx,
                    node_indices[sibling_name],
                    JoinEdge {
                        kind: EdgeKind::Sibling,
                        join_fields: table.primary_key.clone(),
                    },
                );
            }
        }

        // PK-equality steps down to dimension tables whose full key the
        // source table carries. Lineage edges declared above win.
        for (name, table) in tables {
            let from_idx = node_indices[name];
            for (target_name, target) in tables {
                if target_name == name
                    || target.table_type != TableType::Dimension
                    || target.primary_key.is_empty()
                    || table.parent.as_deref() == Some(target_name)
                    || table.siblings.contains(target_name)
                {
                    continue;
                }
                if target.primary_key.iter().all(|f| table.has_field(f)) {
                    graph.add_edge(
                        from_idx,
                        node_indices[target_name],
                        JoinEdge {
                            kind: EdgeKind::PkEquality,
                            join_fields: target.primary_key.clone(),
                        },
                    );
                }
            }
        }

        Ok(Self {
            graph,
            node_indices,
        })
    }

    /// Tables reachable from `table` in a single join step, in
    /// deterministic name order.
    pub fn find_neighbor_tables(&self, table: &str) -> Vec<NeighborTable> {
        let Some(&idx) = self.node_indices.get(table) else {
            return Vec::new();
        };
        let mut out: Vec<NeighborTable> = self
            .graph
            .edges(idx)
            .map(|e| NeighborTable {
                table: self.graph[e.target()].clone(),
                join_fields: e.weight().join_fields.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.table.cmp(&b.table));
        out.dedup_by(|a, b| a.table == b.table);
        out
    }

    /// Transitive closure of child tables under `table` along declared
    /// parent lineage.
    pub fn find_descendent_tables(&self, table: &str) -> Vec<String> {
        let Some(&root) = self.node_indices.get(table) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            for edge in self
                .graph
                .edges_directed(current, petgraph::Direction::Incoming)
            {
                if edge.weight().kind != EdgeKind::Parent {
                    continue;
                }
                let child = self.graph[edge.source()].clone();
                if seen.insert(child) {
                    queue.push_back(edge.source());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// All simple join paths from `table` to any table satisfying
    /// `target`, with at most `max_joins` steps, ordered by increasing
    /// length then lexicographic path.
    fn paths_to(
        &self,
        table: &str,
        target: &dyn Fn(&str) -> bool,
        max_joins: usize,
    ) -> Vec<Join> {
        let Some(&start) = self.node_indices.get(table) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut stack = vec![start];
        let mut path: Vec<JoinPart> = Vec::new();
        self.dfs_paths(start, target, max_joins, &mut stack, &mut path, &mut found);
        found.sort_by(|a: &Join, b: &Join| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        found
    }

    fn dfs_paths(
        &self,
        current: NodeIndex,
        target: &dyn Fn(&str) -> bool,
        max_joins: usize,
        stack: &mut Vec<NodeIndex>,
        path: &mut Vec<JoinPart>,
        found: &mut Vec<Join>,
    ) {
        if !path.is_empty() && target(&self.graph[current]) {
            found.push(Join { parts: path.clone() });
            // Longer paths through a satisfying table are never minimal.
            return;
        }
        if path.len() >= max_joins {
            return;
        }

        let mut edges: Vec<_> = self
            .graph
            .edges(current)
            .map(|e| (self.graph[e.target()].clone(), e.target(), e.weight().join_fields.clone()))
            .collect();
        edges.sort_by(|a, b| a.0.cmp(&b.0));

        for (to_name, to_idx, join_fields) in edges {
            if stack.contains(&to_idx) {
                continue;
            }
            stack.push(to_idx);
            path.push(JoinPart {
                from_table: self.graph[current].clone(),
                to_table: to_name,
                join_fields,
            });
            self.dfs_paths(to_idx, target, max_joins, stack, path, found);
            path.pop();
            stack.pop();
        }
    }

    /// For each grain dimension the table does not provide directly,
    /// the candidate join paths to a provider. Returns `Err` with the
    /// first unreachable dimension.
    pub fn possible_joins(
        &self,
        table: &Table,
        grain: &BTreeSet<String>,
        max_joins: usize,
        tables: &BTreeMap<String, Table>,
    ) -> std::result::Result<BTreeMap<String, Vec<Join>>, String> {
        let mut out = BTreeMap::new();
        for dimension in grain {
            if table.provides_dimension(dimension) {
                continue;
            }
            let provides = |name: &str| {
                tables
                    .get(name)
                    .map(|t| t.provides_dimension(dimension))
                    .unwrap_or(false)
            };
            let paths = self.paths_to(&table.name, &provides, max_joins);
            if paths.is_empty() {
                return Err(dimension.clone());
            }
            out.insert(dimension.clone(), paths);
        }
        Ok(out)
    }

    /// Candidate table sets producing `grain` from `table`: the table
    /// alone when it provides the full grain, otherwise merged covers of
    /// per-dimension join paths. Deterministically ordered by join
    /// count, table priority, then name; capped at
    /// `max_join_candidates`.
    pub fn find_possible_table_sets(
        &self,
        datasource: &str,
        table: &Table,
        grain: &BTreeSet<String>,
        target_fields: &BTreeSet<String>,
        max_joins: usize,
        max_join_candidates: usize,
        tables: &BTreeMap<String, Table>,
    ) -> Vec<TableSet> {
        let make = |join: Option<Join>| TableSet {
            datasource: datasource.to_string(),
            ds_table: table.name.clone(),
            join,
            grain: grain.clone(),
            target_fields: target_fields.clone(),
        };

        let Ok(dim_paths) = self.possible_joins(table, grain, max_joins, tables) else {
            return Vec::new();
        };
        if dim_paths.is_empty() {
            return vec![make(None)];
        }

        // Odometer over the per-dimension path lists, in deterministic
        // key order; merged duplicates collapse. Bounded so pathological
        // schemas cannot explode the product.
        let dims: Vec<&String> = dim_paths.keys().collect();
        let lists: Vec<&Vec<Join>> = dims.iter().map(|d| &dim_paths[*d]).collect();
        let mut counters = vec![0usize; lists.len()];
        let mut candidates: BTreeSet<Join> = BTreeSet::new();
        let max_combinations = max_join_candidates.saturating_mul(64);

        for _ in 0..max_combinations {
            let mut combined = Join::default();
            for (list, &i) in lists.iter().zip(&counters) {
                combined = combined.combine(&list[i]);
            }
            if combined.len() <= max_joins {
                candidates.insert(combined);
            }
            if candidates.len() >= max_join_candidates {
                break;
            }

            // Advance the odometer.
            let mut pos = 0;
            loop {
                if pos == counters.len() {
                    break;
                }
                counters[pos] += 1;
                if counters[pos] < lists[pos].len() {
                    break;
                }
                counters[pos] = 0;
                pos += 1;
            }
            if pos == counters.len() {
                break;
            }
        }

        let mut sets: Vec<TableSet> = candidates.into_iter().map(|j| make(Some(j))).collect();
        sets.sort_by_key(|s| s.join_count());
        sets.truncate(max_join_candidates);
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    fn tables() -> BTreeMap<String, Table> {
        let partners: TableConfig = serde_json::from_str(
            r#"{"type": "dimension", "primary_key": ["partner_id"],
                "columns": {"id": {"fields": ["partner_id"]},
                            "name": {"fields": ["partner_name"]}}}"#,
        )
        .unwrap();
        let campaigns: TableConfig = serde_json::from_str(
            r#"{"type": "dimension", "parent": "main.partners", "primary_key": ["campaign_id"],
                "columns": {"id": {"fields": ["campaign_id"]},
                            "partner_id": {"fields": ["partner_id"]},
                            "name": {"fields": ["campaign_name"]}}}"#,
        )
        .unwrap();
        let leads: TableConfig = serde_json::from_str(
            r#"{"type": "metric", "parent": "main.campaigns", "primary_key": ["lead_id"],
                "columns": {"id": {"fields": ["lead_id", "leads"]},
                            "campaign_id": {"fields": ["campaign_id"]}}}"#,
        )
        .unwrap();
        let sales: TableConfig = serde_json::from_str(
            r#"{"type": "metric", "parent": "main.leads", "primary_key": ["sale_id"],
                "columns": {"id": {"fields": ["sale_id", "sales"]},
                            "lead_id": {"fields": ["lead_id"]},
                            "revenue": {"fields": ["revenue"]}}}"#,
        )
        .unwrap();

        [
            ("main.partners", partners),
            ("main.campaigns", campaigns),
            ("main.leads", leads),
            ("main.sales", sales),
        ]
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), Table::from_config(name, &cfg).unwrap()))
        .collect()
    }

    fn graph(tables: &BTreeMap<String, Table>) -> SchemaGraph {
        SchemaGraph::build("test", tables).unwrap()
    }

    #[test]
    fn test_neighbors_go_upward_only() {
        let tables = tables();
        let g = graph(&tables);

        let neighbors = g.find_neighbor_tables("main.sales");
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].table, "main.leads");
        assert_eq!(neighbors[0].join_fields, vec!["lead_id".to_string()]);

        // A parent cannot step down to its child.
        let neighbors = g.find_neighbor_tables("main.partners");
        assert!(neighbors.is_empty());
    }

    #[test]
    fn test_descendents() {
        let tables = tables();
        let g = graph(&tables);
        let descendents = g.find_descendent_tables("main.campaigns");
        assert_eq!(
            descendents,
            vec!["main.leads".to_string(), "main.sales".to_string()]
        );
        assert!(g.find_descendent_tables("main.sales").is_empty());
    }

    #[test]
    fn test_join_path_up_the_lineage() {
        let tables = tables();
        let g = graph(&tables);
        let grain: BTreeSet<String> = ["partner_name".to_string()].into_iter().collect();
        let sets = g.find_possible_table_sets(
            "test",
            &tables["main.sales"],
            &grain,
            &["revenue".to_string()].into_iter().collect(),
            5,
            25,
            &tables,
        );
        assert_eq!(sets.len(), 1);
        let join = sets[0].join.as_ref().unwrap();
        assert_eq!(join.len(), 3);
        assert_eq!(
            join.tables(),
            vec!["main.sales", "main.leads", "main.campaigns", "main.partners"]
        );
    }

    #[test]
    fn test_downward_grain_unreachable() {
        let tables = tables();
        let g = graph(&tables);
        let grain: BTreeSet<String> = ["sale_id".to_string()].into_iter().collect();
        let sets = g.find_possible_table_sets(
            "test",
            &tables["main.leads"],
            &grain,
            &["leads".to_string()].into_iter().collect(),
            5,
            25,
            &tables,
        );
        assert!(sets.is_empty());
    }

    #[test]
    fn test_max_joins_bound() {
        let tables = tables();
        let g = graph(&tables);
        let grain: BTreeSet<String> = ["partner_name".to_string()].into_iter().collect();
        // partner_name is three steps from sales; a bound of 2 makes it
        // unreachable.
        let sets = g.find_possible_table_sets(
            "test",
            &tables["main.sales"],
            &grain,
            &BTreeSet::new(),
            2,
            25,
            &tables,
        );
        assert!(sets.is_empty());
    }

    #[test]
    fn test_sibling_pk_mismatch_rejected() {
        let mut tables = tables();
        let mut bad = tables["main.sales"].clone();
        bad.siblings = vec!["main.leads".to_string()];
        tables.insert("main.sales".into(), bad);
        let err = SchemaGraph::build("test", &tables).unwrap_err();
        assert!(err.to_string().contains("do not share a primary key"));
    }

    #[test]
    fn test_shared_grain_no_join_needed() {
        let tables = tables();
        let g = graph(&tables);
        let grain: BTreeSet<String> = ["lead_id".to_string()].into_iter().collect();
        let sets = g.find_possible_table_sets(
            "test",
            &tables["main.sales"],
            &grain,
            &BTreeSet::new(),
            5,
            25,
            &tables,
        );
        assert_eq!(sets.len(), 1);
        assert!(sets[0].join.is_none());
    }
}
