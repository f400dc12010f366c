use std::fs::File;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::recipe::Recipe;
use crate::registry::Registry;
use crate::resolver::{self, Closure};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: BomMetadata,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BomMetadata {
    timestamp: String,
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    version: String,
    purl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    licenses: Option<Vec<LicenseWrapper>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hashes: Vec<HashEntry>,
}

#[derive(Debug, Serialize)]
struct LicenseWrapper {
    license: License,
}

#[derive(Debug, Serialize)]
struct License {
    id: String,
}

#[derive(Debug, Serialize)]
struct HashEntry {
    alg: &'static str,
    content: String,
}

/// Write a CycloneDX-style SBOM for a recipe's runtime closure: one component
/// per recipe, carrying its version, license, and declared source hashes.
pub fn generate_sbom(registry: &Registry, name: &str, output: &Path) -> Result<()> {
    let order = resolver::resolve(registry, name, Closure::Runtime, false)?;
    let mut components = Vec::with_capacity(order.len());
    for entry in &order {
        let recipe = registry.lookup(entry)?;
        components.push(component_for(recipe, entry == name));
    }

    let bom = Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: BomMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            tools: vec![Tool {
                name: "cauldron",
                version: env!("CARGO_PKG_VERSION"),
            }],
        },
        components,
    };

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(output)?;
    serde_json::to_writer_pretty(file, &bom).map_err(|err| Error::Recipe {
        path: output.display().to_string(),
        reason: format!("failed to write SBOM JSON: {err}"),
    })?;
    Ok(())
}

fn component_for(recipe: &Recipe, is_root: bool) -> Component {
    let mut hashes = Vec::new();
    if let Some(sha256) = recipe.source.sha256() {
        hashes.push(HashEntry {
            alg: "SHA-256",
            content: sha256.to_string(),
        });
    }

    Component {
        component_type: if is_root { "application" } else { "library" },
        name: recipe.name.clone(),
        version: recipe.version.clone(),
        purl: format!(
            "pkg:generic/{name}@{version}",
            name = recipe.name,
            version = recipe.version
        ),
        licenses: recipe.license.as_ref().map(|expr| {
            vec![LicenseWrapper {
                license: License { id: expr.clone() },
            }]
        }),
        hashes,
    }
}
