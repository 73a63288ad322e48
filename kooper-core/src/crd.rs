//! Declarations of CustomResourceDefinitions managed by kooper
//!
//! A [`CrdConf`] is the client-less description of a resource type to register with the
//! apiserver. It knows how to derive the name of the `CustomResourceDefinition` object and how
//! to render itself into the `apiextensions.k8s.io/v1` wire type.

use std::fmt;

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceSubresourceScale, CustomResourceSubresourceStatus,
        CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde::{Deserialize, Serialize};

/// Categories every kooper managed CRD is registered under, in the order they are appended.
///
/// `all` makes the resource show up in `kubectl get all`.
pub const DEFAULT_CATEGORIES: [&str; 2] = ["all", "kooper"];

/// Whether instances of a resource are cluster wide or live inside a namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Instances are cluster scoped
    #[default]
    Cluster,
    /// Instances live inside a namespace
    Namespaced,
}

impl Scope {
    /// The value used for `spec.scope` on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Cluster => "Cluster",
            Scope::Namespaced => "Namespaced",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of the `scale` subresource
///
/// Paths are JSON paths into the custom resource, e.g. `.spec.replicas`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSubresource {
    /// Path to the desired replicas
    pub spec_replicas_path: String,
    /// Path to the observed replicas
    pub status_replicas_path: String,
    /// Path to the serialized label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector_path: Option<String>,
}

impl From<ScaleSubresource> for CustomResourceSubresourceScale {
    fn from(scale: ScaleSubresource) -> Self {
        CustomResourceSubresourceScale {
            spec_replicas_path: scale.spec_replicas_path,
            status_replicas_path: scale.status_replicas_path,
            label_selector_path: scale.label_selector_path,
        }
    }
}

/// The declaration of a CustomResourceDefinition
///
/// ```
/// use kooper_core::crd::{CrdConf, Scope};
/// let conf = CrdConf::new("Foo", "foos", "example.com", "v1").scope(Scope::Cluster);
/// assert_eq!(conf.crd_name(), "foos.example.com");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdConf {
    /// The kind of the resource, e.g. `Foo`
    pub kind: String,
    /// The plural name of the resource (in most cases the plural of `kind`)
    pub plural: String,
    /// Short aliases of the resource, must be lowercase
    #[serde(default)]
    pub short_names: Vec<String>,
    /// The api group, e.g. `example.com`
    pub group: String,
    /// The api version, e.g. `v1`
    pub version: String,
    /// Whether the resource is cluster scoped or namespaced
    #[serde(default)]
    pub scope: Scope,
    /// Extra categories the resource belongs to
    ///
    /// [`DEFAULT_CATEGORIES`] are always added on top of these.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Enables the `status` subresource
    #[serde(default)]
    pub status_subresource: bool,
    /// Enables the `scale` subresource with the given configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_subresource: Option<ScaleSubresource>,
}

impl CrdConf {
    /// Declare a cluster scoped resource without aliases, categories or subresources
    #[must_use]
    pub fn new(kind: &str, plural: &str, group: &str, version: &str) -> Self {
        Self {
            kind: kind.into(),
            plural: plural.into(),
            group: group.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Set the scope
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Add a short alias
    #[must_use]
    pub fn short_name(mut self, short_name: &str) -> Self {
        self.short_names.push(short_name.into());
        self
    }

    /// Add a category
    #[must_use]
    pub fn category(mut self, category: &str) -> Self {
        self.categories.push(category.into());
        self
    }

    /// Enable the `status` subresource
    #[must_use]
    pub fn with_status(mut self) -> Self {
        self.status_subresource = true;
        self
    }

    /// Enable the `scale` subresource
    #[must_use]
    pub fn with_scale(mut self, scale: ScaleSubresource) -> Self {
        self.scale_subresource = Some(scale);
        self
    }

    /// Name of the `CustomResourceDefinition` object, `<plural>.<group>`
    ///
    /// This is not the name of an instance of the resource, and it must be unique per cluster.
    #[must_use]
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    /// The declared categories merged with [`DEFAULT_CATEGORIES`]
    ///
    /// Declared categories keep their order, missing defaults are appended afterwards.
    /// A category declared more than once is only kept where it first appears.
    #[must_use]
    pub fn categories_with_defaults(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::with_capacity(self.categories.len() + DEFAULT_CATEGORIES.len());
        for category in self.categories.iter().map(String::as_str).chain(DEFAULT_CATEGORIES) {
            if !categories.iter().any(|c| c == category) {
                categories.push(category.to_string());
            }
        }
        categories
    }

    /// The requested subresources, or `None` when neither `status` nor `scale` is enabled
    #[must_use]
    pub fn subresources(&self) -> Option<CustomResourceSubresources> {
        if !self.status_subresource && self.scale_subresource.is_none() {
            return None;
        }
        Some(CustomResourceSubresources {
            status: self
                .status_subresource
                .then(|| CustomResourceSubresourceStatus(serde_json::Value::Object(Default::default()))),
            scale: self.scale_subresource.clone().map(Into::into),
        })
    }

    /// Render the `apiextensions.k8s.io/v1` object for this declaration
    ///
    /// The single declared version is served and stored, with a schema that preserves unknown
    /// fields since kooper does not own the shape of the resource.
    #[must_use]
    pub fn to_definition(&self) -> CustomResourceDefinition {
        let short_names = (!self.short_names.is_empty()).then(|| self.short_names.clone());
        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(self.crd_name()),
                ..ObjectMeta::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: self.group.clone(),
                scope: self.scope.to_string(),
                names: CustomResourceDefinitionNames {
                    kind: self.kind.clone(),
                    plural: self.plural.clone(),
                    short_names,
                    categories: Some(self.categories_with_defaults()),
                    ..CustomResourceDefinitionNames::default()
                },
                versions: vec![CustomResourceDefinitionVersion {
                    name: self.version.clone(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        open_api_v3_schema: Some(JSONSchemaProps {
                            type_: Some("object".into()),
                            x_kubernetes_preserve_unknown_fields: Some(true),
                            ..JSONSchemaProps::default()
                        }),
                    }),
                    subresources: self.subresources(),
                    ..CustomResourceDefinitionVersion::default()
                }],
                ..CustomResourceDefinitionSpec::default()
            },
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CrdConf, ScaleSubresource, Scope};

    fn foo() -> CrdConf {
        CrdConf::new("Foo", "foos", "example.com", "v1")
    }

    #[test]
    fn crd_name_is_plural_dot_group() {
        assert_eq!(foo().crd_name(), "foos.example.com");
    }

    #[test]
    fn default_categories_are_appended() {
        assert_eq!(foo().categories_with_defaults(), vec!["all", "kooper"]);
    }

    #[test]
    fn categories_keep_declared_order_without_duplicates() {
        let conf = foo().category("kooper").category("monitoring").category("all");
        assert_eq!(conf.categories_with_defaults(), vec!["kooper", "monitoring", "all"]);

        let conf = foo().category("zeta").category("all");
        assert_eq!(conf.categories_with_defaults(), vec!["zeta", "all", "kooper"]);
    }

    #[test]
    fn repeated_categories_are_kept_once() {
        let conf = foo().category("db").category("all").category("db").category("all");
        assert_eq!(conf.categories_with_defaults(), vec!["db", "all", "kooper"]);
    }

    #[test]
    fn categories_union_matches_input_plus_defaults() {
        let inputs: [&[&str]; 4] = [&[], &["a"], &["kooper", "b"], &["all", "kooper"]];
        for input in inputs {
            let conf = input.iter().fold(foo(), |c, cat| c.category(cat));
            let merged = conf.categories_with_defaults();
            let mut expected: Vec<String> = input.iter().map(|s| s.to_string()).collect();
            for d in ["all", "kooper"] {
                if !expected.iter().any(|c| c == d) {
                    expected.push(d.into());
                }
            }
            assert_eq!(merged, expected, "input {input:?}");
            let mut dedup = merged.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), merged.len());
        }
    }

    #[test]
    fn no_subresources_unless_requested() {
        assert!(foo().subresources().is_none());
        assert!(foo().to_definition().spec.versions[0].subresources.is_none());
    }

    #[test]
    fn subresources_only_contain_requested_parts() {
        let status_only = foo().with_status().subresources().unwrap();
        assert!(status_only.status.is_some());
        assert!(status_only.scale.is_none());

        let scale_only = foo()
            .with_scale(ScaleSubresource {
                spec_replicas_path: ".spec.replicas".into(),
                status_replicas_path: ".status.replicas".into(),
                label_selector_path: None,
            })
            .subresources()
            .unwrap();
        assert!(scale_only.status.is_none());
        assert_eq!(scale_only.scale.unwrap().spec_replicas_path, ".spec.replicas");
    }

    #[test]
    fn definition_carries_declaration() {
        let crd = foo()
            .scope(Scope::Namespaced)
            .short_name("fo")
            .with_status()
            .to_definition();
        assert_eq!(crd.metadata.name.as_deref(), Some("foos.example.com"));
        assert_eq!(crd.spec.group, "example.com");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "Foo");
        assert_eq!(crd.spec.names.plural, "foos");
        assert_eq!(crd.spec.names.short_names, Some(vec!["fo".to_string()]));
        assert_eq!(
            crd.spec.names.categories,
            Some(vec!["all".to_string(), "kooper".to_string()])
        );
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1");
        assert!(version.served && version.storage);
        let status = serde_json::to_value(version.subresources.as_ref().unwrap()).unwrap();
        assert_eq!(status, serde_json::json!({ "status": {} }));
    }

    #[test]
    fn declarations_load_from_yaml() {
        let conf: CrdConf = serde_yaml::from_str(
            r#"
            kind: Foo
            plural: foos
            group: example.com
            version: v1
            scope: Namespaced
            shortNames: [fo]
            statusSubresource: true
            scaleSubresource:
              specReplicasPath: .spec.replicas
              statusReplicasPath: .status.replicas
            "#,
        )
        .unwrap();
        assert_eq!(conf.scope, Scope::Namespaced);
        assert_eq!(conf.short_names, vec!["fo"]);
        assert!(conf.categories.is_empty());
        assert!(conf.status_subresource);
        assert_eq!(
            conf.scale_subresource.unwrap().status_replicas_path,
            ".status.replicas"
        );
    }
}
