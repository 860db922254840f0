/// Column header tree.
///
/// One level per column field over the cartesian product of axis values,
/// subtotal children appended after a parent's value children, an optional
/// grand-total branch at the root, and a value-field leaf level unless there
/// is exactly one value field.

use super::{axis_label, AxisKey, PivotConfig};
use crate::value::{is_mixed, ColumnValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotHeaderNode {
    pub value: ColumnValue,
    pub label: String,
    pub level: usize,
    pub colspan: usize,
    pub children: Vec<PivotHeaderNode>,
    pub is_leaf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_key: Option<String>,
    pub path: Vec<ColumnValue>,
}

impl PivotHeaderNode {
    fn new(value: ColumnValue, label: String, level: usize, path: Vec<ColumnValue>) -> Self {
        PivotHeaderNode {
            value,
            label,
            level,
            colspan: 0,
            children: Vec::new(),
            is_leaf: false,
            column_key: None,
            path,
        }
    }

    /// Bottom-up colspan: leaves (and childless nodes) are 1, internal nodes
    /// the sum of their children.
    fn finalize(&mut self) -> usize {
        if self.children.is_empty() {
            self.is_leaf = true;
            self.colspan = 1;
        } else {
            self.colspan = self.children.iter_mut().map(PivotHeaderNode::finalize).sum();
        }
        self.colspan
    }
}

/// A generated column: its key plus where its values come from.
#[derive(Debug, Clone)]
pub(crate) struct LeafSlot {
    pub key: String,
    pub col: AxisKey,
    pub value_index: usize,
}

pub(crate) struct HeaderTree {
    pub nodes: Vec<PivotHeaderNode>,
    pub slots: Vec<LeafSlot>,
    pub depth: usize,
}

struct Builder<'a> {
    axes: &'a [Vec<ColumnValue>],
    subtotal_levels: Vec<usize>,
    value_keys: Vec<String>,
    tagged: Vec<bool>,
    slots: Vec<LeafSlot>,
}

impl<'a> Builder<'a> {
    fn field_count(&self) -> usize {
        self.axes.len()
    }

    /// Nodes for axis level `level` under `path`.
    fn level_nodes(&mut self, level: usize, path: &[ColumnValue]) -> Vec<PivotHeaderNode> {
        let axes = self.axes;
        let axis = &axes[level];
        let mut nodes = Vec::with_capacity(axis.len());
        for value in axis {
            let mut node_path = path.to_vec();
            node_path.push(value.clone());
            let mut node = PivotHeaderNode::new(value.clone(), axis_label(value), level, node_path.clone());

            if level + 1 < self.field_count() {
                node.children = self.level_nodes(level + 1, &node_path);
                if self.subtotal_levels.contains(&level) {
                    let label = format!("{} Total", node.label);
                    let subtotal =
                        self.scope_node(level + 1, ColumnValue::Null, label, node_path.clone(), AxisKey::subtotal(node_path));
                    node.children.push(subtotal);
                }
            } else {
                self.attach_values(&mut node, AxisKey::leaf(node_path));
            }
            nodes.push(node);
        }
        nodes
    }

    /// A subtotal or grand-total node at `level`, chained down to the last
    /// axis level so every branch has the same depth.
    fn scope_node(
        &mut self,
        level: usize,
        value: ColumnValue,
        label: String,
        path: Vec<ColumnValue>,
        col: AxisKey,
    ) -> PivotHeaderNode {
        let mut node = PivotHeaderNode::new(value, label, level, path.clone());
        if level + 1 < self.field_count() {
            let child = self.scope_node(level + 1, ColumnValue::Null, String::new(), path, col);
            node.children.push(child);
        } else {
            self.attach_values(&mut node, col);
        }
        node
    }

    /// Turn `node` into the leaf for a single value field, or give it one
    /// leaf child per value field.
    fn attach_values(&mut self, node: &mut PivotHeaderNode, col: AxisKey) {
        if self.value_keys.len() == 1 {
            let key = col.column_key(&self.value_keys[0], &self.tagged);
            node.is_leaf = true;
            node.column_key = Some(key.clone());
            self.slots.push(LeafSlot { key, col, value_index: 0 });
            return;
        }
        for index in 0..self.value_keys.len() {
            let leaf = self.value_leaf(node.level + 1, node.path.clone(), &col, index);
            node.children.push(leaf);
        }
    }

    fn value_leaf(&mut self, level: usize, path: Vec<ColumnValue>, col: &AxisKey, index: usize) -> PivotHeaderNode {
        let value_key = &self.value_keys[index];
        let key = col.column_key(value_key, &self.tagged);
        let mut leaf = PivotHeaderNode::new(ColumnValue::from(value_key.as_str()), value_key.clone(), level, path);
        leaf.is_leaf = true;
        leaf.column_key = Some(key.clone());
        self.slots.push(LeafSlot {
            key,
            col: col.clone(),
            value_index: index,
        });
        leaf
    }
}

/// Pass 3: build the header tree and the leaf slots in left-to-right order.
pub(crate) fn build_header_tree(config: &PivotConfig, axes: &[Vec<ColumnValue>]) -> HeaderTree {
    let mut builder = Builder {
        axes,
        subtotal_levels: config.column_subtotal_levels(),
        value_keys: config.value_fields.iter().map(|vf| vf.key()).collect(),
        tagged: axes.iter().map(|axis| is_mixed(axis)).collect(),
        slots: Vec::new(),
    };

    let mut nodes = if axes.is_empty() {
        let root = AxisKey::leaf(Vec::new());
        (0..builder.value_keys.len())
            .map(|index| builder.value_leaf(0, Vec::new(), &root, index))
            .collect()
    } else {
        let mut nodes = builder.level_nodes(0, &[]);
        if config.has_column_grand_total() {
            let grand = builder.scope_node(
                0,
                ColumnValue::Null,
                "Grand Total".to_string(),
                Vec::new(),
                AxisKey::grand_total(),
            );
            nodes.push(grand);
        }
        nodes
    };

    for node in &mut nodes {
        node.finalize();
    }

    let value_level = usize::from(builder.value_keys.len() > 1);
    HeaderTree {
        nodes,
        slots: builder.slots,
        depth: (axes.len() + value_level).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateFn;
    use crate::pivot::ValueField;

    fn config(columns: &[&str], values: usize) -> PivotConfig {
        PivotConfig {
            column_fields: columns.iter().map(|c| c.to_string()).collect(),
            value_fields: (0..values)
                .map(|i| ValueField::new(format!("v{}", i), AggregateFn::Sum))
                .collect(),
            ..Default::default()
        }
    }

    fn axis(values: &[&str]) -> Vec<ColumnValue> {
        values.iter().map(|v| ColumnValue::from(*v)).collect()
    }

    #[test]
    fn test_single_value_field_makes_axis_node_the_leaf() {
        let cfg = config(&["year", "quarter"], 1);
        let axes = vec![axis(&["2023", "2024"]), axis(&["Q1", "Q2"])];
        let tree = build_header_tree(&cfg, &axes);

        assert_eq!(tree.depth, 2);
        assert_eq!(tree.nodes.len(), 2);
        let first = &tree.nodes[0];
        assert_eq!(first.colspan, 2);
        assert!(first.children.iter().all(|c| c.is_leaf && c.level == 1));
        assert_eq!(first.children[1].column_key.as_deref(), Some("2023|Q2::sum_v0"));
        assert_eq!(first.children[1].path, axis(&["2023", "Q2"]));
    }

    #[test]
    fn test_subtotal_child_is_chained_to_depth() {
        let mut cfg = config(&["a", "b", "c"], 2);
        cfg.show_column_sub_totals = true;
        cfg.column_sub_total_fields = Some(vec!["a".to_string()]);
        let axes = vec![axis(&["x"]), axis(&["p", "q"]), axis(&["1"])];
        let tree = build_header_tree(&cfg, &axes);

        let x = &tree.nodes[0];
        // p, q, then the subtotal
        assert_eq!(x.children.len(), 3);
        let subtotal = &x.children[2];
        assert_eq!(subtotal.label, "x Total");
        assert_eq!(subtotal.level, 1);
        assert_eq!(subtotal.children.len(), 1);
        let chain = &subtotal.children[0];
        assert_eq!(chain.level, 2);
        assert_eq!(chain.children.len(), 2);
        assert_eq!(chain.children[0].column_key.as_deref(), Some("x|__subtotal__::sum_v0"));
        // 2 leaf combos x 2 values + 2 subtotal values
        assert_eq!(x.colspan, 6);
        assert_eq!(tree.slots.len(), 6);
        assert_eq!(tree.depth, 4);
    }

    #[test]
    fn test_grand_total_branch_is_last() {
        let mut cfg = config(&["a"], 1);
        cfg.show_column_grand_totals = true;
        let tree = build_header_tree(&cfg, &[axis(&["x", "y"])]);
        assert_eq!(tree.nodes.len(), 3);
        let grand = tree.nodes.last().unwrap();
        assert_eq!(grand.label, "Grand Total");
        assert_eq!(grand.column_key.as_deref(), Some("__grandtotal__::sum_v0"));
        assert_eq!(tree.slots.last().unwrap().key, "__grandtotal__::sum_v0");
    }

    #[test]
    fn test_no_value_fields_leaves_axis_nodes_as_leaves() {
        let cfg = config(&["a"], 0);
        let tree = build_header_tree(&cfg, &[axis(&["x", "y"])]);
        assert!(tree.nodes.iter().all(|n| n.is_leaf && n.colspan == 1));
        assert!(tree.slots.is_empty());
    }
}
