//! Layout trees: tabs of split panes.
//!
//! A tab is a binary-ish tree of nodes: a pane node references a PTY by id,
//! a split node holds a direction, children, and per-child ratios. Ratios
//! are stored as floats; tiling normalizes them and gives any rounding
//! remainder to the last child so the assigned rects always cover the area
//! exactly.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDirection {
    /// Children stack top to bottom.
    Row,
    /// Children sit side by side.
    Col,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayoutNode {
    Pane {
        pty_id: u64,
        cwd: String,
    },
    Split {
        direction: SplitDirection,
        children: Vec<LayoutNode>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ratio: Vec<f32>,
    },
}

/// A screen-space rectangle in cell units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }
}

impl LayoutNode {
    pub fn pane(pty_id: u64, cwd: impl Into<String>) -> Self {
        LayoutNode::Pane {
            pty_id,
            cwd: cwd.into(),
        }
    }

    /// All pane pty ids, left to right, depth first.
    pub fn pty_ids(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<u64>) {
        match self {
            LayoutNode::Pane { pty_id, .. } => out.push(*pty_id),
            LayoutNode::Split { children, .. } => {
                for child in children {
                    child.collect_ids(out);
                }
            }
        }
    }

    pub fn contains(&self, pty_id: u64) -> bool {
        match self {
            LayoutNode::Pane { pty_id: id, .. } => *id == pty_id,
            LayoutNode::Split { children, .. } => children.iter().any(|c| c.contains(pty_id)),
        }
    }

    /// The cwd recorded for a pane.
    pub fn pane_cwd(&self, pty_id: u64) -> Option<&str> {
        match self {
            LayoutNode::Pane { pty_id: id, cwd } if *id == pty_id => Some(cwd),
            LayoutNode::Pane { .. } => None,
            LayoutNode::Split { children, .. } => {
                children.iter().find_map(|c| c.pane_cwd(pty_id))
            }
        }
    }
}

/// Compute the rect for every pane in the tree.
pub fn tile(node: &LayoutNode, area: Rect, out: &mut Vec<(u64, Rect)>) {
    match node {
        LayoutNode::Pane { pty_id, .. } => out.push((*pty_id, area)),
        LayoutNode::Split {
            direction,
            children,
            ratio,
        } => {
            if children.is_empty() {
                return;
            }
            let weights = normalized_weights(ratio, children.len());
            let total = match direction {
                SplitDirection::Row => area.height,
                SplitDirection::Col => area.width,
            };
            let mut offsets = Vec::with_capacity(children.len());
            let mut used = 0u16;
            for (i, w) in weights.iter().enumerate() {
                let size = if i + 1 == children.len() {
                    // Remainder goes to the last child.
                    total - used
                } else {
                    ((total as f32) * w).floor() as u16
                };
                offsets.push((used, size));
                used += size;
            }
            for (child, (offset, size)) in children.iter().zip(offsets) {
                let rect = match direction {
                    SplitDirection::Row => {
                        Rect::new(area.x, area.y + offset, area.width, size)
                    }
                    SplitDirection::Col => {
                        Rect::new(area.x + offset, area.y, size, area.height)
                    }
                };
                tile(child, rect, out);
            }
        }
    }
}

fn normalized_weights(ratio: &[f32], n: usize) -> Vec<f32> {
    let valid = ratio.len() == n && ratio.iter().all(|r| r.is_finite() && *r > 0.0);
    if !valid {
        return vec![1.0 / n as f32; n];
    }
    let sum: f32 = ratio.iter().sum();
    ratio.iter().map(|r| r / sum).collect()
}

/// Replace the pane holding `target` with a split of it and `new_pane`,
/// even shares. Returns false when `target` is not in the tree.
pub fn split_pane(
    node: &mut LayoutNode,
    target: u64,
    direction: SplitDirection,
    new_pane: LayoutNode,
) -> bool {
    match node {
        LayoutNode::Pane { pty_id, .. } if *pty_id == target => {
            let old = std::mem::replace(
                node,
                LayoutNode::Split {
                    direction,
                    children: Vec::new(),
                    ratio: vec![0.5, 0.5],
                },
            );
            if let LayoutNode::Split { children, .. } = node {
                children.push(old);
                children.push(new_pane);
            }
            true
        }
        LayoutNode::Pane { .. } => false,
        LayoutNode::Split { children, .. } => {
            for child in children.iter_mut() {
                if split_pane(child, target, direction, new_pane.clone()) {
                    return true;
                }
            }
            false
        }
    }
}

/// Remove the pane holding `target`, collapsing single-child splits and
/// renormalizing the remaining ratios to keep their proportions. `None`
/// means the tree is now empty.
pub fn remove_pane(node: LayoutNode, target: u64) -> Option<LayoutNode> {
    match node {
        LayoutNode::Pane { pty_id, .. } if pty_id == target => None,
        pane @ LayoutNode::Pane { .. } => Some(pane),
        LayoutNode::Split {
            direction,
            children,
            ratio,
        } => {
            let had_ratios = ratio.len() == children.len();
            let mut kept_children = Vec::new();
            let mut kept_ratios = Vec::new();
            for (i, child) in children.into_iter().enumerate() {
                if let Some(kept) = remove_pane(child, target) {
                    kept_children.push(kept);
                    if had_ratios {
                        kept_ratios.push(ratio[i]);
                    }
                }
            }
            match kept_children.len() {
                0 => None,
                1 => Some(kept_children.pop().unwrap()),
                _ => {
                    let ratio = if had_ratios {
                        let sum: f32 = kept_ratios.iter().sum();
                        kept_ratios.iter().map(|r| r / sum).collect()
                    } else {
                        Vec::new()
                    };
                    Some(LayoutNode::Split {
                        direction,
                        children: kept_children,
                        ratio,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> Rect {
        Rect::new(0, 0, 80, 24)
    }

    #[test]
    fn single_pane_fills_the_area() {
        let node = LayoutNode::pane(1, "/");
        let mut rects = Vec::new();
        tile(&node, area(), &mut rects);
        assert_eq!(rects, vec![(1, area())]);
    }

    #[test]
    fn even_row_split_halves_the_height() {
        let node = LayoutNode::Split {
            direction: SplitDirection::Row,
            children: vec![LayoutNode::pane(1, "/"), LayoutNode::pane(2, "/")],
            ratio: vec![0.5, 0.5],
        };
        let mut rects = Vec::new();
        tile(&node, area(), &mut rects);
        assert_eq!(rects[0].1, Rect::new(0, 0, 80, 12));
        assert_eq!(rects[1].1, Rect::new(0, 12, 80, 12));
    }

    #[test]
    fn remainder_goes_to_the_last_child() {
        let node = LayoutNode::Split {
            direction: SplitDirection::Col,
            children: vec![
                LayoutNode::pane(1, "/"),
                LayoutNode::pane(2, "/"),
                LayoutNode::pane(3, "/"),
            ],
            ratio: vec![1.0, 1.0, 1.0],
        };
        let mut rects = Vec::new();
        tile(&node, Rect::new(0, 0, 80, 24), &mut rects);
        // 80/3 = 26.67: 26 + 26 + 28.
        assert_eq!(rects[0].1.width, 26);
        assert_eq!(rects[1].1.width, 26);
        assert_eq!(rects[2].1.width, 28);
        let covered: u16 = rects.iter().map(|(_, r)| r.width).sum();
        assert_eq!(covered, 80);
    }

    #[test]
    fn degenerate_ratios_fall_back_to_even_shares() {
        let node = LayoutNode::Split {
            direction: SplitDirection::Row,
            children: vec![LayoutNode::pane(1, "/"), LayoutNode::pane(2, "/")],
            ratio: vec![0.9], // wrong arity
        };
        let mut rects = Vec::new();
        tile(&node, area(), &mut rects);
        assert_eq!(rects[0].1.height, 12);
        assert_eq!(rects[1].1.height, 12);
    }

    #[test]
    fn split_replaces_the_target_pane() {
        let mut node = LayoutNode::pane(1, "/home");
        assert!(split_pane(
            &mut node,
            1,
            SplitDirection::Row,
            LayoutNode::pane(2, "/home")
        ));
        match &node {
            LayoutNode::Split {
                direction,
                children,
                ratio,
            } => {
                assert_eq!(*direction, SplitDirection::Row);
                assert_eq!(children.len(), 2);
                assert_eq!(ratio, &vec![0.5, 0.5]);
                assert!(children[0].contains(1));
                assert!(children[1].contains(2));
            }
            _ => panic!("expected split"),
        }
        assert!(!split_pane(
            &mut node,
            99,
            SplitDirection::Col,
            LayoutNode::pane(3, "/")
        ));
    }

    #[test]
    fn remove_collapses_single_child_splits() {
        let mut node = LayoutNode::pane(1, "/");
        split_pane(&mut node, 1, SplitDirection::Row, LayoutNode::pane(2, "/"));
        let node = remove_pane(node, 2).unwrap();
        assert_eq!(node, LayoutNode::pane(1, "/"));
    }

    #[test]
    fn remove_renormalizes_surviving_ratios() {
        let node = LayoutNode::Split {
            direction: SplitDirection::Col,
            children: vec![
                LayoutNode::pane(1, "/"),
                LayoutNode::pane(2, "/"),
                LayoutNode::pane(3, "/"),
            ],
            ratio: vec![0.5, 0.25, 0.25],
        };
        match remove_pane(node, 1).unwrap() {
            LayoutNode::Split { ratio, .. } => {
                assert!((ratio[0] - 0.5).abs() < f32::EPSILON);
                assert!((ratio[1] - 0.5).abs() < f32::EPSILON);
            }
            _ => panic!("expected split"),
        }
    }

    #[test]
    fn remove_last_pane_empties_the_tree() {
        assert_eq!(remove_pane(LayoutNode::pane(1, "/"), 1), None);
    }

    #[test]
    fn json_shape_round_trips() {
        let node = LayoutNode::Split {
            direction: SplitDirection::Row,
            children: vec![LayoutNode::pane(4, "/srv"), LayoutNode::pane(7, "/tmp")],
            ratio: vec![0.7, 0.3],
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "split");
        assert_eq!(json["direction"], "row");
        assert_eq!(json["children"][0]["type"], "pane");
        assert_eq!(json["children"][0]["pty_id"], 4);
        assert_eq!(json["children"][0]["cwd"], "/srv");
        let back: LayoutNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
