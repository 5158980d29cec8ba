//! Node CSR approver
//!
//! Auto-approves kubelet serving-certificate requests whose identity checks
//! out against a known Machine: the requesting user must be the node, the
//! certificate must be for that node, and every requested SAN must be an
//! address the machine actually has. Anything that fails validation is
//! skipped silently and left for other approvers or a human.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

#[cfg(test)]
use mockall::automock;

use machina_common::crd::Machine;
use machina_common::metrics::{ReconcileTimer, CSRS_APPROVED};
use machina_common::{Error, Result};

const NODE_USER_PREFIX: &str = "system:node:";
const NODE_GROUP: &str = "system:nodes";
const AUTHENTICATED_GROUP: &str = "system:authenticated";

const ALLOWED_USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];

const APPROVAL_REASON: &str =
    "machine-controller NodeCSRApprover controller approved node serving cert";

/// Trait abstracting the Kubernetes operations the approver needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrKubeClient: Send + Sync {
    /// List machines across all namespaces
    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Write the approval condition through the approval subresource
    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<()>;
}

/// Real client implementation
pub struct CsrKubeClientImpl {
    client: Client,
}

impl CsrKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CsrKubeClient for CsrKubeClientImpl {
    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        let data = serde_json::to_vec(csr).map_err(|e| Error::serialization(e.to_string()))?;
        // Approval only goes through the dedicated subresource.
        api.replace_subresource("approval", name, &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Shared context for the approver
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn CsrKubeClient>,
}

impl Context {
    /// Production context from a kube client
    pub fn new(client: Client) -> Self {
        Self {
            kube: Arc::new(CsrKubeClientImpl::new(client)),
        }
    }
}

/// Identity extracted from the x509 certificate request
#[derive(Debug, PartialEq, Eq)]
pub struct CsrIdentity {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// Requested DNS SANs
    pub dns_names: Vec<String>,
    /// Requested IP SANs, textual form
    pub ip_addresses: Vec<String>,
}

/// Reconcile one CertificateSigningRequest
#[instrument(skip(csr, ctx), fields(csr = %csr.name_any()))]
pub async fn reconcile(csr: Arc<CertificateSigningRequest>, ctx: Arc<Context>) -> Result<Action> {
    let timer = ReconcileTimer::start("nodecsrapprover");
    let result = reconcile_inner(&csr, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error("transient"),
    }
    result
}

/// Error policy for the approver
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(error = %error, csr = %csr.name_any(), "csr reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

async fn reconcile_inner(csr: &CertificateSigningRequest, ctx: &Context) -> Result<Action> {
    if is_approved(csr) {
        debug!("csr already approved, skipping");
        return Ok(Action::await_change());
    }

    // A failed check means this is not a CSR for us: leave it pending.
    let node_name = match validate_csr_object(csr) {
        Ok(node_name) => node_name,
        Err(reason) => {
            debug!(reason, "skipping csr");
            return Ok(Action::await_change());
        }
    };

    let machines = ctx.kube.list_machines().await?;
    let Some(machine) = machines
        .iter()
        .find(|m| m.node_name() == Some(node_name.as_str()))
    else {
        debug!(node = %node_name, "no machine bound to requesting node, skipping");
        return Ok(Action::await_change());
    };

    let request = csr
        .spec
        .request
        .0
        .as_slice();
    let identity = match parse_certificate_request(request) {
        Ok(identity) => identity,
        Err(reason) => {
            debug!(reason, "skipping csr with unparsable request");
            return Ok(Action::await_change());
        }
    };

    if let Err(reason) = validate_identity(
        &identity,
        csr.spec.username.as_deref().unwrap_or_default(),
        machine,
        &node_name,
    ) {
        debug!(reason, "skipping csr with mismatched identity");
        return Ok(Action::await_change());
    }

    let mut approved = csr.clone();
    approved
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Default::default)
        .push(CertificateSigningRequestCondition {
            type_: "Approved".to_string(),
            status: "True".to_string(),
            reason: Some(APPROVAL_REASON.to_string()),
            message: Some(format!("Auto-approved serving cert for node {node_name}")),
            last_update_time: Some(Time(chrono::Utc::now())),
            last_transition_time: None,
        });
    ctx.kube.approve(&approved).await?;
    CSRS_APPROVED.add(1, &[]);
    info!(node = %node_name, "approved node serving certificate");

    Ok(Action::await_change())
}

fn is_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|c| c.type_ == "Approved"))
        .unwrap_or(false)
}

/// Validate the CSR object fields; returns the requesting node name
pub fn validate_csr_object(csr: &CertificateSigningRequest) -> std::result::Result<String, String> {
    let username = csr.spec.username.as_deref().unwrap_or_default();
    let Some(node_name) = username.strip_prefix(NODE_USER_PREFIX) else {
        return Err(format!("username must have the {NODE_USER_PREFIX:?} prefix"));
    };
    if node_name.is_empty() {
        return Err("node name is empty".to_string());
    }

    let groups = csr.spec.groups.clone().unwrap_or_default();
    if groups.len() < 2 {
        return Err("there are less than 2 groups".to_string());
    }
    if !groups.iter().any(|g| g == NODE_GROUP) || !groups.iter().any(|g| g == AUTHENTICATED_GROUP)
    {
        return Err(format!(
            "{NODE_GROUP:?} and/or {AUTHENTICATED_GROUP:?} are not in its groups"
        ));
    }

    let usages = csr.spec.usages.clone().unwrap_or_default();
    for usage in &usages {
        if !ALLOWED_USAGES.contains(&usage.as_str()) {
            return Err(format!(
                "usage {usage:?} is not in the list of allowed usages ({ALLOWED_USAGES:?})"
            ));
        }
    }
    for required in ALLOWED_USAGES {
        if !usages.iter().any(|u| u == required) {
            return Err(format!("required usage {required:?} is missing"));
        }
    }

    Ok(node_name.to_string())
}

/// Decode the PEM request and pull out the identity fields
pub fn parse_certificate_request(pem: &[u8]) -> std::result::Result<CsrIdentity, String> {
    let mut blocks = Pem::iter_from_buffer(pem);
    let block = blocks
        .next()
        .ok_or_else(|| "no certificate request found".to_string())?
        .map_err(|e| format!("invalid PEM: {e}"))?;
    if blocks.next().is_some() {
        return Err("found more than one PEM encoded block".to_string());
    }

    let (_, request) = X509CertificationRequest::from_der(&block.contents)
        .map_err(|e| format!("invalid certificate request: {e}"))?;

    let info = &request.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let organizations: Vec<String> = info
        .subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(String::from)
        .collect();

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(extensions) = request.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = format_ip(bytes) {
                                ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(CsrIdentity {
        common_name,
        organizations,
        dns_names,
        ip_addresses,
    })
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Validate the certificate identity against the CSR user and the machine
pub fn validate_identity(
    identity: &CsrIdentity,
    username: &str,
    machine: &Machine,
    node_name: &str,
) -> std::result::Result<(), String> {
    if identity.common_name != username {
        return Err(format!(
            "commonName {:?} is different than CSR username {username:?}",
            identity.common_name
        ));
    }

    if identity.organizations.len() != 1 {
        return Err(format!(
            "expected exactly one organization but got {}",
            identity.organizations.len()
        ));
    }
    if identity.organizations[0] != NODE_GROUP {
        return Err(format!(
            "organization {:?} doesn't match node group {NODE_GROUP:?}",
            identity.organizations[0]
        ));
    }

    // Every SAN must be an address the machine is known to have.
    let mut machine_addresses: BTreeSet<&str> = BTreeSet::new();
    machine_addresses.insert(node_name);
    if let Some(addresses) = machine.status.as_ref().and_then(|s| s.addresses.as_ref()) {
        for address in addresses {
            machine_addresses.insert(address.address.as_str());
        }
    }

    for dns in &identity.dns_names {
        if !dns.is_empty() && !machine_addresses.contains(dns.as_str()) {
            return Err(format!(
                "dns name {dns:?} cannot be associated with node {node_name:?}"
            ));
        }
    }
    for ip in &identity.ip_addresses {
        if !ip.is_empty() && !machine_addresses.contains(ip.as_str()) {
            return Err(format!(
                "ip address {ip:?} cannot be associated with node {node_name:?}"
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec;
    use k8s_openapi::api::core::v1::{NodeAddress, ObjectReference};
    use k8s_openapi::ByteString;
    use machina_common::crd::{MachineSpec, MachineStatus};

    fn csr(username: &str, groups: &[&str], usages: &[&str]) -> CertificateSigningRequest {
        let mut csr = CertificateSigningRequest::default();
        csr.metadata.name = Some("csr-1".to_string());
        csr.spec = CertificateSigningRequestSpec {
            username: Some(username.to_string()),
            groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            usages: Some(usages.iter().map(|u| u.to_string()).collect()),
            request: ByteString(b"not-a-real-pem".to_vec()),
            signer_name: "kubernetes.io/kubelet-serving".to_string(),
            ..Default::default()
        };
        csr
    }

    fn bound_machine(node_name: &str, addresses: &[&str]) -> Machine {
        let mut machine = Machine::new("worker-0", MachineSpec::default());
        machine.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                kind: Some("Node".into()),
                name: Some(node_name.to_string()),
                ..Default::default()
            }),
            addresses: Some(
                addresses
                    .iter()
                    .map(|a| NodeAddress {
                        address: a.to_string(),
                        type_: "InternalIP".to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        machine
    }

    const GOOD_GROUPS: &[&str] = &["system:nodes", "system:authenticated"];
    const GOOD_USAGES: &[&str] = &["digital signature", "key encipherment", "server auth"];

    #[test]
    fn test_valid_object_returns_node_name() {
        let request = csr("system:node:ip-10-0-0-1", GOOD_GROUPS, GOOD_USAGES);
        assert_eq!(validate_csr_object(&request).unwrap(), "ip-10-0-0-1");
    }

    #[test]
    fn test_username_prefix_is_required() {
        let request = csr("system:serviceaccount:kube-system:foo", GOOD_GROUPS, GOOD_USAGES);
        assert!(validate_csr_object(&request).is_err());

        let request = csr("system:node:", GOOD_GROUPS, GOOD_USAGES);
        assert!(validate_csr_object(&request).is_err());
    }

    #[test]
    fn test_both_groups_are_required() {
        let request = csr("system:node:n1", &["system:nodes"], GOOD_USAGES);
        assert!(validate_csr_object(&request).is_err());

        let request = csr(
            "system:node:n1",
            &["system:nodes", "system:masters"],
            GOOD_USAGES,
        );
        assert!(validate_csr_object(&request).is_err());
    }

    #[test]
    fn test_usages_must_be_the_exact_allowed_set() {
        // extra usage
        let request = csr(
            "system:node:n1",
            GOOD_GROUPS,
            &["digital signature", "key encipherment", "server auth", "client auth"],
        );
        assert!(validate_csr_object(&request).is_err());

        // missing usage
        let request = csr(
            "system:node:n1",
            GOOD_GROUPS,
            &["digital signature", "server auth"],
        );
        assert!(validate_csr_object(&request).is_err());
    }

    #[test]
    fn test_identity_cn_must_equal_username() {
        let identity = CsrIdentity {
            common_name: "system:node:other".into(),
            organizations: vec!["system:nodes".into()],
            dns_names: vec![],
            ip_addresses: vec![],
        };
        let machine = bound_machine("n1", &[]);
        assert!(validate_identity(&identity, "system:node:n1", &machine, "n1").is_err());
    }

    #[test]
    fn test_identity_requires_single_node_group_org() {
        let machine = bound_machine("n1", &[]);

        let two_orgs = CsrIdentity {
            common_name: "system:node:n1".into(),
            organizations: vec!["system:nodes".into(), "extra".into()],
            dns_names: vec![],
            ip_addresses: vec![],
        };
        assert!(validate_identity(&two_orgs, "system:node:n1", &machine, "n1").is_err());

        let wrong_org = CsrIdentity {
            common_name: "system:node:n1".into(),
            organizations: vec!["system:masters".into()],
            dns_names: vec![],
            ip_addresses: vec![],
        };
        assert!(validate_identity(&wrong_org, "system:node:n1", &machine, "n1").is_err());
    }

    /// E6: SANs inside the machine's address set pass, others leave the CSR
    /// pending
    #[test]
    fn test_sans_must_be_machine_addresses() {
        let machine = bound_machine("ip-10-0-0-1", &["10.0.0.1"]);

        let good = CsrIdentity {
            common_name: "system:node:ip-10-0-0-1".into(),
            organizations: vec!["system:nodes".into()],
            dns_names: vec!["ip-10-0-0-1".into()],
            ip_addresses: vec!["10.0.0.1".into()],
        };
        assert!(
            validate_identity(&good, "system:node:ip-10-0-0-1", &machine, "ip-10-0-0-1").is_ok()
        );

        let bad = CsrIdentity {
            common_name: "system:node:ip-10-0-0-1".into(),
            organizations: vec!["system:nodes".into()],
            dns_names: vec![],
            ip_addresses: vec!["10.0.0.2".into()],
        };
        assert!(
            validate_identity(&bad, "system:node:ip-10-0-0-1", &machine, "ip-10-0-0-1").is_err()
        );
    }

    #[test]
    fn test_garbage_request_does_not_parse() {
        assert!(parse_certificate_request(b"definitely not pem").is_err());
    }

    #[test]
    fn test_ip_san_formatting() {
        assert_eq!(format_ip(&[10, 0, 0, 1]).unwrap(), "10.0.0.1");
        assert_eq!(
            format_ip(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap(),
            "::1"
        );
        assert!(format_ip(&[1, 2, 3]).is_none());
    }

    #[tokio::test]
    async fn test_already_approved_csr_is_skipped() {
        let mut approved = csr("system:node:n1", GOOD_GROUPS, GOOD_USAGES);
        approved.status = Some(k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        // no kube expectations: nothing may be called
        let kube = MockCsrKubeClient::new();
        let ctx = Arc::new(Context { kube: Arc::new(kube) });
        reconcile(Arc::new(approved), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_csr_without_machine_is_left_pending() {
        let pending = csr("system:node:unknown-node", GOOD_GROUPS, GOOD_USAGES);

        let mut kube = MockCsrKubeClient::new();
        kube.expect_list_machines()
            .returning(|| Ok(vec![bound_machine("some-other-node", &[])]));
        // approve must never be called
        let ctx = Arc::new(Context { kube: Arc::new(kube) });
        reconcile(Arc::new(pending), ctx).await.unwrap();
    }
}
