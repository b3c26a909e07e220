//! # Model module
//!
//! This module provide the object model of the fabric policy api, treated as
//! an opaque set of tagged objects with stable identity paths

use serde::{Deserialize, Serialize};

use crate::svc::nsx::store::Identified;

// -----------------------------------------------------------------------------
// Tag structure

#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub struct Tag {
    #[serde(rename = "scope")]
    pub scope: String,
    #[serde(rename = "tag")]
    pub tag: String,
}

impl Tag {
    pub fn new(scope: &str, tag: &str) -> Self {
        Self {
            scope: scope.to_string(),
            tag: tag.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Vpc structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Vpc {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "Vpc::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "private_ips", default, skip_serializing_if = "Vec::is_empty")]
    pub private_ips: Vec<String>,
    #[serde(rename = "default_snat_ip", default, skip_serializing_if = "Option::is_none")]
    pub default_snat_ip: Option<String>,
    #[serde(rename = "vlan_backed", default)]
    pub vlan_backed: bool,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Vpc {
    pub const RESOURCE_TYPE: &'static str = "Vpc";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for Vpc {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// VpcSubnet structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct VpcSubnet {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "VpcSubnet::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "access_mode", default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    #[serde(rename = "ipv4_subnet_size", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_size: Option<u32>,
    #[serde(rename = "ip_addresses", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(rename = "parent_path", default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl VpcSubnet {
    pub const RESOURCE_TYPE: &'static str = "VpcSubnet";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for VpcSubnet {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// VpcSubnetPort structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct VpcSubnetPort {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "VpcSubnetPort::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "parent_path", default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "attachment", default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<PortAttachment>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PortAttachment {
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "allocate_addresses", default, skip_serializing_if = "Option::is_none")]
    pub allocate_addresses: Option<String>,
}

impl VpcSubnetPort {
    pub const RESOURCE_TYPE: &'static str = "VpcSubnetPort";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for VpcSubnetPort {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// SecurityPolicy structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SecurityPolicy {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "SecurityPolicy::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "sequence_number", default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(rename = "scope", default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(rename = "rules", default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl SecurityPolicy {
    pub const RESOURCE_TYPE: &'static str = "SecurityPolicy";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for SecurityPolicy {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// Rule structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Rule {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "Rule::resource_type")]
    pub resource_type: String,
    #[serde(rename = "direction")]
    pub direction: String,
    #[serde(rename = "action")]
    pub action: String,
    #[serde(rename = "sequence_number", default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(rename = "source_groups", default, skip_serializing_if = "Vec::is_empty")]
    pub source_groups: Vec<String>,
    #[serde(rename = "destination_groups", default, skip_serializing_if = "Vec::is_empty")]
    pub destination_groups: Vec<String>,
    #[serde(rename = "services", default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(rename = "service_entries", default, skip_serializing_if = "Vec::is_empty")]
    pub service_entries: Vec<serde_json::Value>,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
}

impl Rule {
    pub const RESOURCE_TYPE: &'static str = "Rule";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

// -----------------------------------------------------------------------------
// Group structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Group {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "Group::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "expression", default, skip_serializing_if = "Vec::is_empty")]
    pub expression: Vec<serde_json::Value>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Group {
    pub const RESOURCE_TYPE: &'static str = "Group";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for Group {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// SubnetConnectionBindingMap structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SubnetConnectionBindingMap {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "SubnetConnectionBindingMap::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "subnet_path", default, skip_serializing_if = "Option::is_none")]
    pub subnet_path: Option<String>,
    #[serde(rename = "vlan_traffic_tag", default, skip_serializing_if = "Option::is_none")]
    pub vlan_traffic_tag: Option<i64>,
    #[serde(rename = "parent_path", default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl SubnetConnectionBindingMap {
    pub const RESOURCE_TYPE: &'static str = "SubnetConnectionBindingMap";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for SubnetConnectionBindingMap {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// IpAddressAllocation structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct IpAddressAllocation {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "display_name")]
    pub display_name: String,
    #[serde(rename = "resource_type", default = "IpAddressAllocation::resource_type")]
    pub resource_type: String,
    #[serde(rename = "tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(rename = "allocation_size", default, skip_serializing_if = "Option::is_none")]
    pub allocation_size: Option<u32>,
    #[serde(rename = "ip_block_visibility", default, skip_serializing_if = "Option::is_none")]
    pub ip_block_visibility: Option<String>,
    #[serde(rename = "allocation_ips", default, skip_serializing_if = "Option::is_none")]
    pub allocation_ips: Option<String>,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl IpAddressAllocation {
    pub const RESOURCE_TYPE: &'static str = "VpcIpAddressAllocation";

    fn resource_type() -> String {
        Self::RESOURCE_TYPE.to_string()
    }
}

impl Identified for IpAddressAllocation {
    fn id(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.id)
    }
}

// -----------------------------------------------------------------------------
// Hierarchical patch structures

/// one node of the intended-children tree handed to the fabric's hierarchical
/// api, the fabric reconciles the whole tree atomically
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ChildNode {
    #[serde(rename = "resource_type")]
    pub resource_type: String,
    #[serde(rename = "marked_for_delete", default)]
    pub marked_for_delete: bool,
    #[serde(flatten)]
    pub body: serde_json::Value,
    #[serde(rename = "children", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildNode>,
}

impl ChildNode {
    /// wrap a policy object into its `Child<Type>` envelope, the object
    /// itself lands under the lowercased type key
    pub fn wrap<T>(resource_type: &str, object: &T, marked_for_delete: bool) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        let mut key = resource_type.to_string();
        if let Some(first) = key.get_mut(0..1) {
            first.make_ascii_uppercase();
        }

        Ok(Self {
            resource_type: format!("Child{key}"),
            marked_for_delete,
            body: serde_json::json!({
                resource_type: serde_json::to_value(object)?,
            }),
            children: vec![],
        })
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct OrgRoot {
    #[serde(rename = "resource_type", default = "OrgRoot::resource_type")]
    pub resource_type: String,
    #[serde(rename = "children", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildNode>,
}

impl OrgRoot {
    fn resource_type() -> String {
        "OrgRoot".to_string()
    }

    pub fn with(children: Vec<ChildNode>) -> Self {
        Self {
            resource_type: Self::resource_type(),
            children,
        }
    }
}

// -----------------------------------------------------------------------------
// NodeVersion structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct NodeVersion {
    #[serde(rename = "node_version")]
    pub node_version: String,
    #[serde(rename = "product_version", default)]
    pub product_version: Option<String>,
}
