use std::io::Read;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::models::Person;
use crate::registry::Registry;

#[derive(Debug, Deserialize)]
struct CsvRow {
    id_card_number: String,
    #[serde(rename = "type")]
    person_type: String,
    name: String,
    last_name: String,
    institutional_email: Option<String>,
    email: String,
    primary_phone: String,
    secondary_phone: Option<String>,
    observations: Option<String>,
}

/// Loads people from CSV. Rows whose id card number is already registered
/// are skipped; returns how many people were inserted.
pub async fn import_persons<R: Read>(registry: &dyn Registry, source: R) -> anyhow::Result<usize> {
    let rows = csv::Reader::from_reader(source)
        .deserialize::<CsvRow>()
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse persons CSV")?;
    let types = registry.person_types().await?;

    let mut inserted = 0usize;
    for row in rows {
        match registry.get_person(&row.id_card_number).await {
            Ok(_) => {
                debug!(person = %row.id_card_number, "person already registered, skipping");
                continue;
            }
            Err(RegistryError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let type_id = types
            .iter()
            .find(|kind| kind.name.eq_ignore_ascii_case(row.person_type.trim()))
            .map(|kind| kind.id)
            .with_context(|| {
                format!(
                    "unknown person type '{}' for {}",
                    row.person_type, row.id_card_number
                )
            })?;

        let id_card_number = row.id_card_number.clone();
        let person = Person {
            id_card_number: row.id_card_number,
            type_id,
            name: row.name,
            last_name: row.last_name,
            institutional_email: row.institutional_email,
            email: row.email,
            primary_phone: row.primary_phone,
            secondary_phone: row.secondary_phone,
            observations: row.observations,
        };
        match registry.create_person(person).await {
            Ok(_) => inserted += 1,
            Err(RegistryError::Duplicate {
                entity: "person",
                key,
            }) => {
                debug!(person = %key, "person already registered, skipping");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to import person {id_card_number}"));
            }
        }
    }

    info!(inserted, "persons imported");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;

    const CSV: &str = "\
id_card_number,type,name,last_name,institutional_email,email,primary_phone,secondary_phone,observations
V-100,Profesor,Rosa,Linares,rlinares@ucab.edu.ve,rosa@example.com,0212-4075111,,
V-200,estudiante,Pedro,Arias,,pedro@example.com,0414-1234567,0212-5550101,Becado
V-100,Profesor,Rosa,Linares,rlinares@ucab.edu.ve,rosa@example.com,0212-4075111,,
";

    #[tokio::test]
    async fn imports_new_people_and_skips_known_ones() {
        let registry = MemoryRegistry::default();
        registry.seed_defaults().await.unwrap();

        let inserted = import_persons(&registry, CSV.as_bytes()).await.unwrap();
        assert_eq!(inserted, 2);

        let pedro = registry.get_person("V-200").await.unwrap();
        assert_eq!(pedro.institutional_email, None);
        assert_eq!(pedro.secondary_phone.as_deref(), Some("0212-5550101"));
        assert_eq!(pedro.observations.as_deref(), Some("Becado"));

        let again = import_persons(&registry, CSV.as_bytes()).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn institutional_email_clash_is_an_error() {
        let registry = MemoryRegistry::default();
        registry.seed_defaults().await.unwrap();
        let csv = "\
id_card_number,type,name,last_name,institutional_email,email,primary_phone,secondary_phone,observations
V-100,Profesor,Rosa,Linares,shared@ucab.edu.ve,rosa@example.com,0212-4075111,,
V-999,Profesor,Juan,Mena,shared@ucab.edu.ve,juan@example.com,0212-4075112,,
";
        let err = import_persons(&registry, csv.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("V-999"));
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::Duplicate {
                entity: "institutional email",
                ..
            })
        ));
        assert!(registry.get_person("V-100").await.is_ok());
        assert!(registry.get_person("V-999").await.is_err());
    }

    #[tokio::test]
    async fn unknown_person_type_fails() {
        let registry = MemoryRegistry::default();
        registry.seed_defaults().await.unwrap();
        let csv = "\
id_card_number,type,name,last_name,institutional_email,email,primary_phone,secondary_phone,observations
V-300,Decano,Luisa,Mora,,luisa@example.com,0212-0000000,,
";
        let err = import_persons(&registry, csv.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("Decano"));
    }
}
