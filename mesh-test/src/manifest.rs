//! Named manifest templates.
//!
//! Mesh configuration is applied as YAML documents with `{{slot}}`
//! placeholders (most often `{{namespace}}`), so the target namespace is an
//! explicit parameter of every render rather than baked into the text.

use crate::{heredoc::doc, Error, Result};
use std::{borrow::Cow, collections::BTreeMap, sync::OnceLock};

/// A YAML template with `{{slot}}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    template: String,
}

/// Values substituted into manifest slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct Vars(BTreeMap<String, String>);

/// Manifests keyed by scenario name.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    manifests: BTreeMap<String, Manifest>,
}

fn slot() -> &'static regex::Regex {
    static SLOT: OnceLock<regex::Regex> = OnceLock::new();
    SLOT.get_or_init(|| {
        regex::Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("slot pattern must compile")
    })
}

// === impl Manifest ===

impl Manifest {
    /// Creates a manifest. Common indentation of `template` is stripped and
    /// the text ends with exactly one newline.
    pub fn new(name: impl Into<String>, template: &str) -> Self {
        Self {
            name: name.into(),
            template: format!("{}\n", doc(template).trim_end()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Names of the slots the template refers to.
    pub fn slots(&self) -> Vec<String> {
        let mut slots = slot()
            .captures_iter(&self.template)
            .map(|c| c[1].to_string())
            .collect::<Vec<_>>();
        slots.sort();
        slots.dedup();
        slots
    }

    /// Substitutes every slot. Fails if a slot has no value.
    pub fn render(&self, vars: &Vars) -> Result<String> {
        let mut missing = Vec::new();
        let rendered = slot().replace_all(&self.template, |caps: &regex::Captures<'_>| {
            match vars.0.get(&caps[1]) {
                Some(value) => Cow::Owned(value.clone()),
                None => {
                    missing.push(caps[1].to_string());
                    Cow::Owned(caps[0].to_string())
                }
            }
        });
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(Error::Template {
                name: self.name.clone(),
                reason: format!("no value for slot(s) {}", missing.join(", ")),
            });
        }
        Ok(rendered.into_owned())
    }
}

// === impl Vars ===

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vars with the `namespace` slot set.
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self::new().set("namespace", ns)
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

// === impl Catalog ===

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a manifest. Names must be unique.
    pub fn insert(&mut self, manifest: Manifest) -> Result<()> {
        if self.manifests.contains_key(manifest.name()) {
            return Err(Error::Template {
                name: manifest.name,
                reason: "a manifest with this name is already registered".to_string(),
            });
        }
        self.manifests.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    pub fn with(mut self, name: &str, template: &str) -> Result<Self> {
        self.insert(Manifest::new(name, template))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Manifest> {
        self.manifests
            .get(name)
            .ok_or_else(|| Error::UnknownManifest(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.manifests.keys().map(String::as_str)
    }

    pub fn render(&self, name: &str, vars: &Vars) -> Result<String> {
        self.get(name)?.render(vars)
    }

    /// Renders several manifests into one multi-document YAML stream.
    pub fn render_all(&self, names: &[&str], vars: &Vars) -> Result<String> {
        let docs = names
            .iter()
            .map(|name| self.render(name, vars))
            .collect::<Result<Vec<_>>>()?;
        Ok(docs
            .iter()
            .map(|d| d.trim_matches('\n'))
            .collect::<Vec<_>>()
            .join("\n---\n"))
    }

    /// Mesh security configuration shared by the authentication and
    /// authorization scenarios.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (name, template) in BUILTIN {
            // Names in BUILTIN are distinct.
            let _ = catalog.insert(Manifest::new(*name, template));
        }
        catalog
    }
}

pub const PEER_AUTHENTICATION_STRICT: &str = "peer-authentication-strict";
pub const PEER_AUTHENTICATION_PERMISSIVE: &str = "peer-authentication-permissive";
pub const DESTINATION_RULE_ISTIO_MUTUAL: &str = "destination-rule-istio-mutual";
pub const HTTPBIN_GATEWAY: &str = "httpbin-gateway";
pub const JWT_REQUEST_AUTHENTICATION: &str = "jwt-request-authentication";
pub const REQUIRE_TOKEN_POLICY: &str = "require-token-policy";

const BUILTIN: &[(&str, &str)] = &[
    (
        PEER_AUTHENTICATION_STRICT,
        "
        apiVersion: security.istio.io/v1beta1
        kind: PeerAuthentication
        metadata:
          name: default
          namespace: {{namespace}}
        spec:
          mtls:
            mode: STRICT
        ",
    ),
    (
        PEER_AUTHENTICATION_PERMISSIVE,
        "
        apiVersion: security.istio.io/v1beta1
        kind: PeerAuthentication
        metadata:
          name: default
          namespace: {{namespace}}
        spec:
          mtls:
            mode: PERMISSIVE
        ",
    ),
    (
        DESTINATION_RULE_ISTIO_MUTUAL,
        "
        apiVersion: networking.istio.io/v1beta1
        kind: DestinationRule
        metadata:
          name: {{service}}
          namespace: {{namespace}}
        spec:
          host: {{service}}.{{namespace}}.svc.cluster.local
          trafficPolicy:
            tls:
              mode: ISTIO_MUTUAL
        ",
    ),
    (
        HTTPBIN_GATEWAY,
        r#"
        apiVersion: networking.istio.io/v1beta1
        kind: Gateway
        metadata:
          name: httpbin-gateway
          namespace: {{namespace}}
        spec:
          selector:
            istio: ingressgateway
          servers:
          - port:
              number: 80
              name: http
              protocol: HTTP
            hosts:
            - "*"
        ---
        apiVersion: networking.istio.io/v1beta1
        kind: VirtualService
        metadata:
          name: httpbin
          namespace: {{namespace}}
        spec:
          hosts:
          - "*"
          gateways:
          - httpbin-gateway
          http:
          - route:
            - destination:
                port:
                  number: 8000
                host: httpbin.{{namespace}}.svc.cluster.local
        "#,
    ),
    (
        JWT_REQUEST_AUTHENTICATION,
        r#"
        apiVersion: security.istio.io/v1beta1
        kind: RequestAuthentication
        metadata:
          name: jwt-example
          namespace: {{namespace}}
        spec:
          selector:
            matchLabels:
              istio: ingressgateway
          jwtRules:
          - issuer: "{{issuer}}"
            jwksUri: "{{jwks_uri}}"
        "#,
    ),
    (
        REQUIRE_TOKEN_POLICY,
        r#"
        apiVersion: security.istio.io/v1beta1
        kind: AuthorizationPolicy
        metadata:
          name: frontend-ingress
          namespace: {{namespace}}
        spec:
          selector:
            matchLabels:
              istio: ingressgateway
          action: DENY
          rules:
          - from:
            - source:
                notRequestPrincipals: ["*"]
        "#,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_namespace() {
        let yaml = Catalog::builtin()
            .render(PEER_AUTHENTICATION_STRICT, &Vars::namespace("foo"))
            .unwrap();
        assert!(yaml.starts_with("apiVersion: security.istio.io/v1beta1\n"));
        assert!(yaml.contains("  namespace: foo\n"));
        assert!(yaml.contains("    mode: STRICT"));
        assert!(!yaml.contains("{{"));
    }

    #[test]
    fn spaced_slots_are_recognized() {
        let m = Manifest::new("ns", "name: {{ namespace }}");
        assert_eq!(m.slots(), vec!["namespace".to_string()]);
        assert_eq!(m.render(&Vars::namespace("bar")).unwrap(), "name: bar\n");
    }

    #[test]
    fn missing_slot_is_an_error() {
        let err = Catalog::builtin()
            .render(DESTINATION_RULE_ISTIO_MUTUAL, &Vars::namespace("foo"))
            .unwrap_err();
        match err {
            Error::Template { name, reason } => {
                assert_eq!(name, DESTINATION_RULE_ISTIO_MUTUAL);
                assert!(reason.contains("service"), "{reason}");
            }
            err => panic!("unexpected error: {err}"),
        }

        let yaml = Catalog::builtin()
            .render(
                DESTINATION_RULE_ISTIO_MUTUAL,
                &Vars::namespace("foo").set("service", "httpbin"),
            )
            .unwrap();
        assert!(yaml.contains("host: httpbin.foo.svc.cluster.local"));
    }

    #[test]
    fn unknown_and_duplicate_names() {
        let catalog = Catalog::new().with("a", "kind: A").unwrap();
        assert!(matches!(
            catalog.get("b"),
            Err(Error::UnknownManifest(name)) if name == "b"
        ));
        assert!(matches!(
            catalog.with("a", "kind: A2"),
            Err(Error::Template { .. })
        ));
    }

    #[test]
    fn render_all_joins_documents() {
        let catalog = Catalog::new()
            .with("a", "\n  kind: A\n  ns: {{namespace}}\n")
            .unwrap()
            .with("b", "kind: B")
            .unwrap();
        let yaml = catalog.render_all(&["a", "b"], &Vars::namespace("x")).unwrap();
        assert_eq!(yaml, "kind: A\nns: x\n---\nkind: B");
    }

    #[test]
    fn builtin_catalog_is_complete() {
        let names = Catalog::builtin().names().map(str::to_string).collect::<Vec<_>>();
        assert_eq!(names.len(), BUILTIN.len());
    }
}
