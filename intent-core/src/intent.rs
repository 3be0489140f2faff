//! Immutable intent model.
//!
//! Concrete connectivity flavours are a closed sum type ([`IntentPayload`])
//! carried alongside the common fields; compilers and installers are looked
//! up by the payload's [`IntentKind`] tag.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::IntentError;
use crate::key::{ApplicationId, IdGenerator, IntentId, Key};

/// Smallest accepted intent priority.
pub const MIN_PRIORITY: u16 = 1;
/// Largest accepted intent priority.
pub const MAX_PRIORITY: u16 = u16::MAX;
/// Priority used when the builder is not given one.
pub const DEFAULT_PRIORITY: u16 = 100;

/// Attachment point of a device (`device/port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectPoint {
    /// Device identifier.
    pub device: String,
    /// Port number on the device.
    pub port: u32,
}

impl ConnectPoint {
    /// Creates a connect point.
    pub fn new(device: impl Into<String>, port: u32) -> Self {
        Self {
            device: device.into(),
            port,
        }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// Abstract network resource an intent claims or depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetworkResource {
    /// Infrastructure device.
    Device(String),
    /// Single port of a device.
    Port(ConnectPoint),
    /// Unidirectional link between two ports.
    Link {
        /// Link source.
        src: ConnectPoint,
        /// Link destination.
        dst: ConnectPoint,
    },
    /// Anything else a resource subsystem tracks.
    Opaque(String),
}

impl fmt::Display for NetworkResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(device) => write!(f, "device:{device}"),
            Self::Port(port) => write!(f, "port:{port}"),
            Self::Link { src, dst } => write!(f, "link:{src}->{dst}"),
            Self::Opaque(label) => write!(f, "resource:{label}"),
        }
    }
}

/// Grouping tag shared by intents that claim resources together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceGroup(pub u64);

/// Runtime tag of an intent payload; the dispatch key for compilers and installers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntentKind {
    /// [`IntentPayload::PointToPoint`]
    PointToPoint,
    /// [`IntentPayload::MultiPointToSinglePoint`]
    MultiPointToSinglePoint,
    /// [`IntentPayload::SinglePointToMultiPoint`]
    SinglePointToMultiPoint,
    /// [`IntentPayload::LinkCollection`]
    LinkCollection,
    /// [`IntentPayload::Path`]
    Path,
    /// [`IntentPayload::FlowRule`]
    FlowRule,
    /// [`IntentPayload::FlowObjective`]
    FlowObjective,
    /// [`IntentPayload::Custom`]
    Custom,
}

impl IntentKind {
    /// Stable lowercase label, used in logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PointToPoint => "point-to-point",
            Self::MultiPointToSinglePoint => "multi-point-to-single-point",
            Self::SinglePointToMultiPoint => "single-point-to-multi-point",
            Self::LinkCollection => "link-collection",
            Self::Path => "path",
            Self::FlowRule => "flow-rule",
            Self::FlowObjective => "flow-objective",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque device-level rule carried by installable intents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Device the rule targets.
    pub device: String,
    /// Match/selector expression, opaque to the engine.
    pub selector: String,
    /// Actions/treatment expression, opaque to the engine.
    pub treatment: String,
}

/// Payload variants. Only the tag matters to the engine; the contents belong
/// to compilers and installers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentPayload {
    /// Connectivity between two attachment points.
    PointToPoint {
        /// Traffic ingress.
        ingress: ConnectPoint,
        /// Traffic egress.
        egress: ConnectPoint,
        /// Opaque traffic selector.
        selector: String,
    },
    /// Many ingress points converging on one egress.
    MultiPointToSinglePoint {
        /// Traffic ingresses.
        ingress: BTreeSet<ConnectPoint>,
        /// Traffic egress.
        egress: ConnectPoint,
    },
    /// One ingress fanning out to many egress points.
    SinglePointToMultiPoint {
        /// Traffic ingress.
        ingress: ConnectPoint,
        /// Traffic egresses.
        egress: BTreeSet<ConnectPoint>,
    },
    /// Explicit set of links to program.
    LinkCollection {
        /// Links making up the tree.
        links: Vec<NetworkResource>,
    },
    /// Explicit ordered path.
    Path {
        /// Hops of the path in order.
        hops: Vec<NetworkResource>,
    },
    /// Device rules, installable as-is.
    FlowRule {
        /// Rules to program.
        rules: Vec<FlowSpec>,
    },
    /// Device objectives, installable as-is.
    FlowObjective {
        /// Objectives to program.
        objectives: Vec<FlowSpec>,
    },
    /// Extension point for payloads outside the built-in set.
    Custom {
        /// Free-form type label.
        label: String,
        /// Free-form attributes.
        attributes: Vec<(String, String)>,
    },
}

impl IntentPayload {
    /// Tag used for compiler/installer dispatch.
    #[must_use]
    pub const fn kind(&self) -> IntentKind {
        match self {
            Self::PointToPoint { .. } => IntentKind::PointToPoint,
            Self::MultiPointToSinglePoint { .. } => IntentKind::MultiPointToSinglePoint,
            Self::SinglePointToMultiPoint { .. } => IntentKind::SinglePointToMultiPoint,
            Self::LinkCollection { .. } => IntentKind::LinkCollection,
            Self::Path { .. } => IntentKind::Path,
            Self::FlowRule { .. } => IntentKind::FlowRule,
            Self::FlowObjective { .. } => IntentKind::FlowObjective,
            Self::Custom { .. } => IntentKind::Custom,
        }
    }

    fn installable_by_default(&self) -> bool {
        matches!(self, Self::FlowRule { .. } | Self::FlowObjective { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IntentInner {
    id: IntentId,
    app_id: ApplicationId,
    key: Key,
    priority: u16,
    resources: BTreeSet<NetworkResource>,
    resource_group: Option<ResourceGroup>,
    installable: bool,
    non_disruptive: bool,
    payload: IntentPayload,
}

/// Immutable description of desired connectivity.
///
/// Cheap to clone. Equality and hashing use only the system-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent(Arc<IntentInner>);

impl Intent {
    /// Starts a builder for `app_id` carrying `payload`.
    #[must_use]
    pub fn builder(app_id: ApplicationId, payload: IntentPayload) -> IntentBuilder {
        IntentBuilder::new(app_id, payload)
    }

    /// System-assigned identifier.
    #[must_use]
    pub fn id(&self) -> IntentId {
        self.0.id
    }

    /// Owning application.
    #[must_use]
    pub fn app_id(&self) -> &ApplicationId {
        &self.0.app_id
    }

    /// Stable key; unchanged across recompilation.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.0.key
    }

    /// Priority in `[1, 65535]`.
    #[must_use]
    pub fn priority(&self) -> u16 {
        self.0.priority
    }

    /// Resources claimed by the intent.
    #[must_use]
    pub fn resources(&self) -> &BTreeSet<NetworkResource> {
        &self.0.resources
    }

    /// Optional resource group tag.
    #[must_use]
    pub fn resource_group(&self) -> Option<&ResourceGroup> {
        self.0.resource_group.as_ref()
    }

    /// Whether the intent can be handed to an installer directly.
    #[must_use]
    pub fn is_installable(&self) -> bool {
        self.0.installable
    }

    /// Whether recompilation of an installed instance must avoid traffic disruption.
    #[must_use]
    pub fn is_non_disruptive(&self) -> bool {
        self.0.non_disruptive
    }

    /// Connectivity payload.
    #[must_use]
    pub fn payload(&self) -> &IntentPayload {
        &self.0.payload
    }

    /// Dispatch tag of the payload.
    #[must_use]
    pub fn kind(&self) -> IntentKind {
        self.0.payload.kind()
    }

    /// Compares everything but the id; used to detect identical recompilation results.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let (a, b) = (&self.0, &other.0);
        a.key == b.key
            && a.priority == b.priority
            && a.resources == b.resources
            && a.resource_group == b.resource_group
            && a.installable == b.installable
            && a.payload == b.payload
    }
}

impl PartialEq for Intent {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Intent {}

impl Hash for Intent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} {}]", self.0.key, self.kind(), self.0.id)
    }
}

/// Returns true when both installable lists carry the same content in the same order.
#[must_use]
pub fn same_installables(left: &[Intent], right: &[Intent]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(a, b)| a.same_content(b))
}

/// Pure value builder for [`Intent`]; nothing happens until [`IntentBuilder::build`].
#[must_use]
pub struct IntentBuilder {
    app_id: ApplicationId,
    payload: IntentPayload,
    key: Option<Key>,
    priority: u32,
    resources: BTreeSet<NetworkResource>,
    resource_group: Option<ResourceGroup>,
    installable: Option<bool>,
    non_disruptive: bool,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl IntentBuilder {
    fn new(app_id: ApplicationId, payload: IntentPayload) -> Self {
        Self {
            app_id,
            payload,
            key: None,
            priority: u32::from(DEFAULT_PRIORITY),
            resources: BTreeSet::new(),
            resource_group: None,
            installable: None,
            non_disruptive: false,
            ids: None,
        }
    }

    /// Binds the identifier generator used by `build`.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Explicit key; defaults to one derived from the assigned id.
    pub fn key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Priority, validated at build time.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds claimed resources.
    pub fn resources(mut self, resources: impl IntoIterator<Item = NetworkResource>) -> Self {
        self.resources.extend(resources);
        self
    }

    /// Resource group tag.
    pub fn resource_group(mut self, group: ResourceGroup) -> Self {
        self.resource_group = Some(group);
        self
    }

    /// Overrides whether the intent is directly installable.
    pub fn installable(mut self, installable: bool) -> Self {
        self.installable = Some(installable);
        self
    }

    /// Requests make-before-break reallocation on recompilation.
    pub fn non_disruptive(mut self, non_disruptive: bool) -> Self {
        self.non_disruptive = non_disruptive;
        self
    }

    /// Validates and assigns an id.
    ///
    /// # Errors
    ///
    /// [`IntentError::MissingIdGenerator`] when no generator is bound and
    /// [`IntentError::InvalidPriority`] when the priority is out of range.
    pub fn build(self) -> Result<Intent, IntentError> {
        let ids = self.ids.ok_or(IntentError::MissingIdGenerator)?;
        let priority = u16::try_from(self.priority)
            .ok()
            .filter(|priority| *priority >= MIN_PRIORITY)
            .ok_or(IntentError::InvalidPriority {
                priority: self.priority,
                min: MIN_PRIORITY,
                max: MAX_PRIORITY,
            })?;
        let id = ids.next_id();
        let key = self
            .key
            .unwrap_or_else(|| Key::from_intent_id(id, &self.app_id));
        let installable = self
            .installable
            .unwrap_or_else(|| self.payload.installable_by_default());
        Ok(Intent(Arc::new(IntentInner {
            id,
            app_id: self.app_id,
            key,
            priority,
            resources: self.resources,
            resource_group: self.resource_group,
            installable,
            non_disruptive: self.non_disruptive,
            payload: self.payload,
        })))
    }
}
