use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use super::OrganizationKind;
use crate::authz::error::HierarchyError;

/// One organization as seen by the tree checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub kind: OrganizationKind,
    /// Root-first, ending with `id`
    pub path: Vec<Uuid>,
    pub depth: usize,
}

/// New path and depth for one node after a reparent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathUpdate {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub path: Vec<Uuid>,
    pub depth: usize,
}

impl PathUpdate {
    pub fn path_literal(&self) -> String {
        let ids: Vec<String> = self.path.iter().map(Uuid::to_string).collect();
        format!("{{{}}}", ids.join(","))
    }
}

/// Arena over a set of organization rows. Every walk is capped at
/// `max_depth` and fails closed.
#[derive(Debug, Clone)]
pub struct OrgTree {
    nodes: HashMap<Uuid, OrgNode>,
    children: HashMap<Uuid, Vec<Uuid>>,
    max_depth: usize,
}

impl OrgTree {
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            max_depth,
        }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = OrgNode>, max_depth: usize) -> Self {
        let mut tree = Self::new(max_depth);
        for node in nodes {
            tree.insert(node);
        }
        tree
    }

    pub fn insert(&mut self, node: OrgNode) {
        if let Some(previous) = self.nodes.get(&node.id) {
            if let Some(old_parent) = previous.parent_id {
                if let Some(siblings) = self.children.get_mut(&old_parent) {
                    siblings.retain(|id| *id != node.id);
                }
            }
        }
        if let Some(parent) = node.parent_id {
            self.children.entry(parent).or_default().push(node.id);
        }
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: &Uuid) -> Option<&OrgNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn node(&self, id: &Uuid) -> Result<&OrgNode, HierarchyError> {
        self.nodes.get(id).ok_or(HierarchyError::OrgNotFound(*id))
    }

    /// Root-first ancestor chain ending with `org`, following `parent_id`
    pub fn lineage(&self, org: Uuid) -> Result<Vec<Uuid>, HierarchyError> {
        let mut chain = vec![org];
        let mut seen = HashSet::from([org]);
        let mut current = self.node(&org)?;

        while let Some(parent) = current.parent_id {
            if chain.len() > self.max_depth {
                return Err(HierarchyError::DepthExceeded {
                    org,
                    max: self.max_depth,
                });
            }
            if !seen.insert(parent) {
                return Err(HierarchyError::InconsistentPath {
                    org,
                    detail: format!("parent chain loops back to {}", parent),
                });
            }
            chain.push(parent);
            current = self.node(&parent)?;
        }

        chain.reverse();
        Ok(chain)
    }

    /// `org` plus every descendant, breadth-first
    pub fn subtree(&self, org: Uuid) -> Result<Vec<Uuid>, HierarchyError> {
        self.node(&org)?;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([(org, 0usize)]);

        while let Some((id, hops)) = queue.pop_front() {
            if hops > self.max_depth {
                return Err(HierarchyError::DepthExceeded {
                    org,
                    max: self.max_depth,
                });
            }
            if !seen.insert(id) {
                return Err(HierarchyError::InconsistentPath {
                    org: id,
                    detail: "reached twice while walking children".to_string(),
                });
            }
            out.push(id);
            if let Some(kids) = self.children.get(&id) {
                queue.extend(kids.iter().map(|kid| (*kid, hops + 1)));
            }
        }

        Ok(out)
    }

    /// Stored path and depth of `org` must equal its parent chain
    pub fn check_lineage(&self, org: Uuid) -> Result<(), HierarchyError> {
        let node = self.node(&org)?;
        let chain = self.lineage(org).map_err(|e| match e {
            HierarchyError::OrgNotFound(missing) if missing != org => HierarchyError::InconsistentPath {
                org,
                detail: format!("ancestor {} is missing", missing),
            },
            other => other,
        })?;

        if node.path != chain {
            return Err(HierarchyError::InconsistentPath {
                org,
                detail: format!(
                    "stored path has {} element(s), parent chain has {}",
                    node.path.len(),
                    chain.len()
                ),
            });
        }
        if node.depth + 1 != chain.len() {
            return Err(HierarchyError::InconsistentPath {
                org,
                detail: format!("depth {} does not match path length {}", node.depth, chain.len()),
            });
        }
        Ok(())
    }

    /// Audit every node. Returns all problems found, empty when consistent.
    pub fn verify(&self) -> Vec<HierarchyError> {
        let mut problems = Vec::new();
        let mut ids: Vec<&Uuid> = self.nodes.keys().collect();
        ids.sort();

        for id in ids {
            if let Err(e) = self.check_lineage(*id) {
                problems.push(e);
                continue;
            }
            let node = &self.nodes[id];
            if let Some(parent_id) = node.parent_id {
                if let Some(parent) = self.nodes.get(&parent_id) {
                    if let Err(e) = OrganizationKind::check_nesting(parent.kind, node.kind) {
                        problems.push(e);
                    }
                }
            }
        }
        problems
    }

    /// Plan reparenting `org` under `new_parent`. Nothing is mutated; the
    /// result covers `org` and every descendant.
    pub fn plan_move(&self, org: Uuid, new_parent: Uuid) -> Result<Vec<PathUpdate>, HierarchyError> {
        let moving = self.node(&org)?;
        let parent = self.node(&new_parent)?;

        if new_parent == org || self.lineage(new_parent)?.contains(&org) {
            return Err(HierarchyError::CycleDetected { org, new_parent });
        }

        OrganizationKind::check_nesting(parent.kind, moving.kind)?;
        self.check_lineage(new_parent)?;

        let old_prefix = moving.path.clone();
        let mut new_prefix = parent.path.clone();
        new_prefix.push(org);

        let mut updates = Vec::new();
        for id in self.subtree(org)? {
            let node = self.node(&id)?;
            let Some(suffix) = node.path.strip_prefix(old_prefix.as_slice()) else {
                return Err(HierarchyError::InconsistentPath {
                    org: id,
                    detail: format!("path does not start with the path of {}", org),
                });
            };

            let mut path = new_prefix.clone();
            path.extend_from_slice(suffix);
            let depth = path.len() - 1;
            if depth > self.max_depth {
                return Err(HierarchyError::DepthExceeded {
                    org: id,
                    max: self.max_depth,
                });
            }

            updates.push(PathUpdate {
                id,
                parent_id: if id == org { Some(new_parent) } else { node.parent_id },
                path,
                depth,
            });
        }

        Ok(updates)
    }

    /// Apply planned updates in memory
    pub fn apply(&mut self, updates: &[PathUpdate]) {
        for update in updates {
            if let Some(node) = self.nodes.get(&update.id).cloned() {
                self.insert(OrgNode {
                    parent_id: update.parent_id,
                    path: update.path.clone(),
                    depth: update.depth,
                    ..node
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrganizationKind::*;

    struct Fixture {
        tree: OrgTree,
        federation: Uuid,
        union_a: Uuid,
        union_b: Uuid,
        local_a: Uuid,
        chapter_a: Uuid,
    }

    fn node(id: Uuid, parent: Option<&OrgNode>, kind: OrganizationKind) -> OrgNode {
        let mut path = parent.map(|p| p.path.clone()).unwrap_or_default();
        path.push(id);
        OrgNode {
            id,
            parent_id: parent.map(|p| p.id),
            kind,
            depth: path.len() - 1,
            path,
        }
    }

    fn fixture() -> Fixture {
        let f = node(Uuid::new_v4(), None, Federation);
        let ua = node(Uuid::new_v4(), Some(&f), Union);
        let ub = node(Uuid::new_v4(), Some(&f), Union);
        let la = node(Uuid::new_v4(), Some(&ua), Local);
        let ca = node(Uuid::new_v4(), Some(&la), Chapter);
        Fixture {
            federation: f.id,
            union_a: ua.id,
            union_b: ub.id,
            local_a: la.id,
            chapter_a: ca.id,
            tree: OrgTree::from_nodes(vec![f, ua, ub, la, ca], 32),
        }
    }

    #[test]
    fn lineage_is_root_first_and_ends_with_self() {
        let fx = fixture();
        assert_eq!(
            fx.tree.lineage(fx.chapter_a).unwrap(),
            vec![fx.federation, fx.union_a, fx.local_a, fx.chapter_a]
        );
        assert_eq!(fx.tree.lineage(fx.federation).unwrap(), vec![fx.federation]);
    }

    #[test]
    fn subtree_excludes_ancestors_and_siblings() {
        let fx = fixture();
        let sub = fx.tree.subtree(fx.union_a).unwrap();
        assert_eq!(sub.len(), 3);
        assert!(sub.contains(&fx.union_a));
        assert!(sub.contains(&fx.local_a));
        assert!(sub.contains(&fx.chapter_a));
        assert!(!sub.contains(&fx.federation));
        assert!(!sub.contains(&fx.union_b));
    }

    #[test]
    fn every_descendant_has_org_in_its_lineage() {
        let fx = fixture();
        for org in [fx.federation, fx.union_a, fx.local_a] {
            for d in fx.tree.subtree(org).unwrap() {
                assert!(fx.tree.lineage(d).unwrap().contains(&org));
            }
        }
    }

    #[test]
    fn consistent_tree_verifies_clean() {
        let fx = fixture();
        assert!(fx.tree.verify().is_empty());
    }

    #[test]
    fn stale_path_is_an_integrity_error() {
        let mut fx = fixture();
        let mut local = fx.tree.get(&fx.local_a).unwrap().clone();
        local.path = vec![fx.federation, fx.union_b, fx.local_a];
        fx.tree.insert(local);

        let err = fx.tree.check_lineage(fx.local_a).unwrap_err();
        assert!(err.is_integrity());
        assert!(!fx.tree.verify().is_empty());
    }

    #[test]
    fn missing_ancestor_is_an_integrity_error() {
        let fx = fixture();
        let partial = OrgTree::from_nodes(
            vec![
                fx.tree.get(&fx.union_a).unwrap().clone(),
                fx.tree.get(&fx.local_a).unwrap().clone(),
            ],
            32,
        );
        assert!(partial.check_lineage(fx.local_a).unwrap_err().is_integrity());
    }

    #[test]
    fn unknown_org_is_not_found() {
        let fx = fixture();
        let ghost = Uuid::new_v4();
        assert_eq!(fx.tree.lineage(ghost).unwrap_err(), HierarchyError::OrgNotFound(ghost));
        assert_eq!(fx.tree.subtree(ghost).unwrap_err(), HierarchyError::OrgNotFound(ghost));
    }

    #[test]
    fn move_under_own_descendant_is_a_cycle() {
        let fx = fixture();
        let err = fx.tree.plan_move(fx.union_a, fx.local_a).unwrap_err();
        assert_eq!(
            err,
            HierarchyError::CycleDetected {
                org: fx.union_a,
                new_parent: fx.local_a,
            }
        );
        let err = fx.tree.plan_move(fx.union_a, fx.union_a).unwrap_err();
        assert!(matches!(err, HierarchyError::CycleDetected { .. }));
    }

    #[test]
    fn move_recomputes_whole_subtree() {
        let mut fx = fixture();
        let updates = fx.tree.plan_move(fx.local_a, fx.union_b).unwrap();
        assert_eq!(updates.len(), 2);

        let local = updates.iter().find(|u| u.id == fx.local_a).unwrap();
        assert_eq!(local.parent_id, Some(fx.union_b));
        assert_eq!(local.path, vec![fx.federation, fx.union_b, fx.local_a]);
        assert_eq!(local.depth, 2);

        let chapter = updates.iter().find(|u| u.id == fx.chapter_a).unwrap();
        assert_eq!(chapter.parent_id, Some(fx.local_a));
        assert_eq!(
            chapter.path,
            vec![fx.federation, fx.union_b, fx.local_a, fx.chapter_a]
        );

        fx.tree.apply(&updates);
        assert!(fx.tree.verify().is_empty());
        assert!(!fx.tree.subtree(fx.union_a).unwrap().contains(&fx.chapter_a));
        assert!(fx.tree.subtree(fx.union_b).unwrap().contains(&fx.chapter_a));
    }

    #[test]
    fn move_respects_nesting_rules() {
        let fx = fixture();
        let err = fx.tree.plan_move(fx.union_b, fx.local_a).unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidNesting { .. }));
    }

    #[test]
    fn move_past_depth_limit_fails() {
        let fx = fixture();
        let shallow = OrgTree::from_nodes(fx.tree.nodes.values().cloned(), 2);
        let err = shallow.plan_move(fx.local_a, fx.union_b);
        // local moves to depth 2 but its chapter would land on 3
        assert!(matches!(err, Err(HierarchyError::DepthExceeded { .. })));
    }

    #[test]
    fn looping_parent_chain_fails_closed() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tree = OrgTree::from_nodes(
            vec![
                OrgNode { id: a, parent_id: Some(b), kind: Union, path: vec![b, a], depth: 1 },
                OrgNode { id: b, parent_id: Some(a), kind: Union, path: vec![a, b], depth: 1 },
            ],
            8,
        );
        assert!(tree.lineage(a).unwrap_err().is_integrity());
    }

    #[test]
    fn overly_deep_chain_is_rejected() {
        let mut nodes = Vec::new();
        let mut parent: Option<OrgNode> = None;
        for _ in 0..6 {
            let n = node(Uuid::new_v4(), parent.as_ref(), Union);
            parent = Some(n.clone());
            nodes.push(n);
        }
        let leaf = nodes.last().unwrap().id;
        let root = nodes[0].id;
        let tree = OrgTree::from_nodes(nodes, 3);
        assert!(matches!(tree.lineage(leaf), Err(HierarchyError::DepthExceeded { .. })));
        assert!(matches!(tree.subtree(root), Err(HierarchyError::DepthExceeded { .. })));
    }
}
