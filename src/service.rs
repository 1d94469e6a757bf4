//! `FamilyGraph`: the contract surface the API layer calls into.
//!
//! Wires the store, the configured limits and the external collaborators
//! (access control, notifications) around the module-level operations.

use std::sync::Arc;

use crate::access::{AccessControl, RoleBasedAccess};
use crate::config::Config;
use crate::db::Db;
use crate::discovery::{self, Component, DiscoveryLimits};
use crate::error::Result;
use crate::identity::{self, Profile, ProfileRef, Resolution};
use crate::layout::{self, LayoutSnapshot, PositionedGraph};
use crate::notify::{self, GraphEvent, LogNotifier, Notifier};
use crate::requests::{self, ConnectionRequest, Decision, DecisionOutcome, RequestLists};
use crate::store::{self, RelationshipEdge};
use crate::vocab::{RelationshipKind, Role};

#[derive(Clone)]
pub struct FamilyGraph {
    db: Db,
    config: Config,
    access: Arc<dyn AccessControl>,
    notifier: Arc<dyn Notifier>,
}

impl FamilyGraph {
    /// Graph service with role-based access control and log notifications.
    pub fn new(db: Db, config: Config) -> Self {
        Self {
            db,
            config,
            access: Arc::new(RoleBasedAccess),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn register_account(&self, email: &str, display_name: &str) -> Result<Profile> {
        identity::register_account(&self.db, &self.config.identity, email, display_name).await
    }

    pub async fn profile(&self, profile_id: &str) -> Result<Profile> {
        identity::get_profile(&self.db, profile_id).await
    }

    pub async fn profile_for_account(&self, account_id: &str) -> Result<Profile> {
        identity::profile_for_account(&self.db, account_id).await
    }

    pub async fn resolve_identity(&self, reference: ProfileRef) -> Result<Resolution> {
        identity::resolve(&self.db, &self.config.identity, reference).await
    }

    pub async fn create_edge(
        &self,
        subject_id: &str,
        object_id: &str,
        kind: RelationshipKind,
        role: Role,
    ) -> Result<RelationshipEdge> {
        store::create_edge(&self.db, subject_id, object_id, kind, role).await
    }

    /// Record `reference` as the caller's `kind` without a handshake.
    ///
    /// Placeholders are accepted and only the caller's edge is written: a
    /// direct add is the caller's own annotation, not a mutually confirmed
    /// relationship. Resolution and the edge commit together, so a rejected
    /// edge leaves no placeholder behind.
    pub async fn add_family_member(
        &self,
        caller_id: &str,
        reference: ProfileRef,
        kind: RelationshipKind,
        role: Option<Role>,
    ) -> Result<RelationshipEdge> {
        let caller = caller_id.to_string();
        let role = role.unwrap_or_default();
        let (resolution, edge) = identity::resolve_then(
            &self.db,
            &self.config.identity,
            reference,
            move |conn, resolution| store::insert_edge(conn, &caller, &resolution.profile_id, kind, role),
        )
        .await?;
        log::info!(
            "{} added {} as {} (new profile: {})",
            caller_id, resolution.profile_id, kind, resolution.created
        );
        Ok(edge)
    }

    pub async fn list_outgoing(&self, subject_id: &str) -> Result<Vec<RelationshipEdge>> {
        store::list_outgoing(&self.db, subject_id).await
    }

    pub async fn list_incoming(&self, object_id: &str) -> Result<Vec<RelationshipEdge>> {
        store::list_incoming(&self.db, object_id).await
    }

    pub async fn edge(&self, edge_id: &str) -> Result<RelationshipEdge> {
        store::get_edge(&self.db, edge_id).await
    }

    pub async fn update_role(&self, caller_id: &str, edge_id: &str, role: Role) -> Result<RelationshipEdge> {
        store::update_role(&self.db, self.access.clone(), caller_id, edge_id, role).await
    }

    pub async fn delete_edge(&self, caller_id: &str, edge_id: &str) -> Result<RelationshipEdge> {
        store::delete_edge(&self.db, self.access.clone(), caller_id, edge_id).await
    }

    pub async fn propose(
        &self,
        sender_id: &str,
        receiver: ProfileRef,
        kind: RelationshipKind,
        message: Option<String>,
    ) -> Result<ConnectionRequest> {
        let request =
            requests::propose(&self.db, &self.config.identity, sender_id, receiver, kind, message).await?;
        notify::dispatch(
            self.notifier.as_ref(),
            GraphEvent::ConnectionRequested { request: request.clone() },
        );
        Ok(request)
    }

    pub async fn decide(&self, request_id: &str, receiver_id: &str, decision: Decision) -> Result<DecisionOutcome> {
        let outcome = requests::decide(&self.db, request_id, receiver_id, decision).await?;
        let event = match decision {
            Decision::Approved => GraphEvent::ConnectionApproved {
                request: outcome.request.clone(),
                edges: outcome.edges.clone(),
            },
            Decision::Declined => GraphEvent::ConnectionDeclined { request: outcome.request.clone() },
        };
        notify::dispatch(self.notifier.as_ref(), event);
        Ok(outcome)
    }

    pub async fn request(&self, request_id: &str) -> Result<ConnectionRequest> {
        requests::get_request(&self.db, request_id).await
    }

    pub async fn requests_for(&self, profile_id: &str) -> Result<RequestLists> {
        requests::list_for_profile(&self.db, profile_id).await
    }

    /// Component around `seed_id` using the configured limits.
    pub async fn discover(&self, seed_id: &str) -> Result<Component> {
        self.discover_within(seed_id, self.config.discovery.into()).await
    }

    pub async fn discover_within(&self, seed_id: &str, limits: DiscoveryLimits) -> Result<Component> {
        discovery::discover(&self.db, seed_id, limits).await
    }

    pub async fn save_layout(&self, profile_id: &str, snapshot: &LayoutSnapshot) -> Result<()> {
        layout::save_layout(&self.db, profile_id, snapshot).await
    }

    pub async fn load_layout(&self, profile_id: &str) -> Result<Option<LayoutSnapshot>> {
        layout::load_layout(&self.db, profile_id).await
    }

    /// "My family graph": discover, then position with the saved layout on top.
    pub async fn family_view(&self, profile_id: &str) -> Result<PositionedGraph> {
        self.family_view_within(profile_id, self.config.discovery.into()).await
    }

    pub async fn family_view_within(&self, profile_id: &str, limits: DiscoveryLimits) -> Result<PositionedGraph> {
        let component = self.discover_within(profile_id, limits).await?;
        let profiles =
            identity::load_profiles(&self.db, component.nodes.iter().cloned().collect()).await?;
        let snapshot = self.load_layout(profile_id).await?;
        Ok(layout::arrange(&component, &profiles, snapshot.as_ref(), &self.config.layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use crate::error::{ErrorKind, KingraphError};
    use crate::layout::{Point, SavedNode, Viewport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    impl Notifier for FailingNotifier {
        fn notify(&self, _event: &GraphEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(KingraphError::Upstream("mail relay down".to_string()))
        }
    }

    async fn service() -> (FamilyGraph, tempfile::TempDir) {
        let (db, temp) = setup_test_db().await;
        (FamilyGraph::new(db, Config::default()), temp)
    }

    #[tokio::test]
    async fn test_add_member_by_name_creates_single_edge() {
        let (graph, _temp) = service().await;
        let me = graph.register_account("me@example.com", "Me").await.unwrap();

        let edge = graph
            .add_family_member(
                &me.profile_id,
                ProfileRef::Name("Grandpa Joe".to_string()),
                RelationshipKind::Grandparent,
                None,
            )
            .await
            .unwrap();
        assert_eq!(edge.subject_id, me.profile_id);
        assert_eq!(edge.role, Role::Viewer);

        let grandpa = graph.profile(&edge.object_id).await.unwrap();
        assert!(grandpa.is_placeholder);
        assert_eq!(grandpa.display_name, "Grandpa Joe");
        assert!(graph.list_outgoing(&grandpa.profile_id).await.unwrap().is_empty());
        assert_eq!(graph.list_incoming(&grandpa.profile_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_member_twice_conflicts() {
        let (graph, _temp) = service().await;
        let me = graph.register_account("me@example.com", "Me").await.unwrap();
        let sis = ProfileRef::Email { email: "sis@example.com".to_string(), display_name: Some("Sis".to_string()) };

        graph.add_family_member(&me.profile_id, sis.clone(), RelationshipKind::Sibling, None).await.unwrap();
        let err = graph
            .add_family_member(&me.profile_id, sis, RelationshipKind::Sibling, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    async fn profile_count(graph: &FamilyGraph) -> i64 {
        graph
            .db()
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM profiles", [], |r| r.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_add_leaves_no_placeholder() {
        let (graph, _temp) = service().await;
        let me = graph.register_account("me@example.com", "Me").await.unwrap();

        let err = graph
            .add_family_member("ghost", ProfileRef::Name("Aunt May".to_string()), RelationshipKind::AuntUncle, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(profile_count(&graph).await, 1);

        // Edge insert fails after the placeholder row was written
        graph
            .db()
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER no_cousins BEFORE INSERT ON relationship_edges \
                     WHEN NEW.kind = 'COUSIN' BEGIN SELECT RAISE(ABORT, 'cousins disabled'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let cousin = ProfileRef::Email { email: "cuz@example.com".to_string(), display_name: None };
        let err = graph
            .add_family_member(&me.profile_id, cousin.clone(), RelationshipKind::Cousin, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KingraphError::Database(_)));
        assert_eq!(profile_count(&graph).await, 1);

        // A duplicate edge is not mistaken for a lost race
        graph.add_family_member(&me.profile_id, cousin.clone(), RelationshipKind::Sibling, None).await.unwrap();
        assert_eq!(profile_count(&graph).await, 2);
        let err = graph
            .add_family_member(&me.profile_id, cousin, RelationshipKind::Sibling, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(profile_count(&graph).await, 2);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_workflow() {
        let (graph, _temp) = service().await;
        let notifier = Arc::new(FailingNotifier { calls: AtomicUsize::new(0) });
        let graph = graph.with_notifier(notifier.clone());
        let a = graph.register_account("a@example.com", "A").await.unwrap();
        let b = graph.register_account("b@example.com", "B").await.unwrap();

        let request = graph
            .propose(&a.profile_id, ProfileRef::Existing(b.profile_id.clone()), RelationshipKind::Parent, None)
            .await
            .unwrap();
        let outcome = graph.decide(&request.request_id, &b.profile_id, Decision::Approved).await.unwrap();
        assert_eq!(outcome.edges.len(), 2);
        assert_eq!(graph.request(&request.request_id).await.unwrap().status, outcome.request.status);
        assert_eq!(graph.edge(&outcome.edges[1].edge_id).await.unwrap().kind, RelationshipKind::Child);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_family_view_positions_component() {
        let (graph, _temp) = service().await;
        let me = graph.register_account("me@example.com", "Me").await.unwrap();
        let dad = graph.register_account("dad@example.com", "Dad").await.unwrap();
        let edge = graph
            .create_edge(&me.profile_id, &dad.profile_id, RelationshipKind::Parent, Role::Viewer)
            .await
            .unwrap();
        graph
            .add_family_member(&dad.profile_id, ProfileRef::Name("Uncle Bo".to_string()), RelationshipKind::Sibling, None)
            .await
            .unwrap();

        let view = graph.family_view(&me.profile_id).await.unwrap();
        assert_eq!(view.nodes.len(), 3);
        assert_eq!(view.nodes[0].id, me.profile_id);
        assert_eq!(view.nodes[0].position, Point::ORIGIN);
        assert!(view.nodes[0].data.is_seed);

        let dad_node = view.nodes.iter().find(|n| n.id == dad.profile_id).unwrap();
        assert_eq!(dad_node.data.label, "Dad");
        assert!(dad_node.data.is_direct);
        let uncle = view.nodes.iter().find(|n| n.data.label == "Uncle Bo").unwrap();
        assert!(uncle.data.is_placeholder);
        assert!(!uncle.data.is_direct);

        let shown = view.edges.iter().find(|e| e.id == edge.edge_id).unwrap();
        assert_eq!(shown.source, dad.profile_id);
        assert_eq!(shown.target, me.profile_id);

        // Saved positions win for nodes still in the graph
        let snapshot = LayoutSnapshot {
            nodes: vec![
                SavedNode { id: dad.profile_id.clone(), position: Point { x: 0.0, y: -150.0 }, data: serde_json::Value::Null },
                SavedNode { id: "removed".to_string(), position: Point { x: 9.0, y: 9.0 }, data: serde_json::Value::Null },
            ],
            viewport: Viewport { x: 1.0, y: 2.0, zoom: 2.0 },
        };
        graph.save_layout(&me.profile_id, &snapshot).await.unwrap();
        let view = graph.family_view(&me.profile_id).await.unwrap();
        let dad_node = view.nodes.iter().find(|n| n.id == dad.profile_id).unwrap();
        assert_eq!(dad_node.position, Point { x: 0.0, y: -150.0 });
        assert_eq!(view.nodes.len(), 3);
        assert_eq!(view.viewport.zoom, 2.0);
    }

    #[tokio::test]
    async fn test_update_role_through_service() {
        let (graph, _temp) = service().await;
        let me = graph.register_account("me@example.com", "Me").await.unwrap();
        let kid = graph.register_account("kid@example.com", "Kid").await.unwrap();
        let edge = graph
            .create_edge(&me.profile_id, &kid.profile_id, RelationshipKind::Child, Role::Viewer)
            .await
            .unwrap();

        let err = graph.update_role(&kid.profile_id, &edge.edge_id, Role::LegacyKeeper).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let updated = graph.update_role(&me.profile_id, &edge.edge_id, Role::LegacyKeeper).await.unwrap();
        assert_eq!(updated.role, Role::LegacyKeeper);

        // Now a keeper, the kid may manage the parent's relationships
        let other = graph.register_account("other@example.com", "Other").await.unwrap();
        let second = graph
            .create_edge(&me.profile_id, &other.profile_id, RelationshipKind::Cousin, Role::Viewer)
            .await
            .unwrap();
        graph.update_role(&kid.profile_id, &second.edge_id, Role::Contributor).await.unwrap();
        graph.delete_edge(&kid.profile_id, &second.edge_id).await.unwrap();
        assert_eq!(graph.list_outgoing(&me.profile_id).await.unwrap().len(), 1);
    }
}
