//! Basic usage example for `FieldSeal`.

use fieldseal::envelope::peek_version;
use fieldseal::prelude::*;
use fieldseal::store::{Cell, MemoryStore};
use fieldseal_key_file::FileKeySource;
use secrecy::ExposeSecret;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("FieldSeal Basic Usage Example");
    println!("=============================\n");

    let key_dir = tempfile::tempdir()?;
    let source = FileKeySource::init(key_dir.path(), "v1")?;
    let registry = Arc::new(KeyRegistry::from_source(&source)?);
    let current = registry.current()?;
    println!(
        "✓ Key directory initialized, current key {} ({})\n",
        current.label(),
        current.fingerprint()
    );

    // Live read/write path
    let plan = ColumnPlan::new("clients", "date_of_birth_enc").with_plaintext("date_of_birth");
    let field = EncryptedField::new(Arc::clone(&registry), &plan);
    let stored = field.encrypt_value("1990-05-15", Some(42))?;
    println!("Stored value: {stored}");
    println!("✓ Decrypted: {}\n", field.decrypt_value(&stored, Some(42))?);

    // Backfill a legacy column
    let store = Arc::new(MemoryStore::new());
    store.create_table("clients", &["date_of_birth", "date_of_birth_enc"]);
    for (id, dob) in [(1, "1984-02-29"), (2, "2001-11-03"), (3, "1990-05-15")] {
        store.insert("clients", id, vec![("date_of_birth", Cell::from(dob))]);
    }
    let config =
        EngineConfig { rate_limit_ms: 0, columns: vec![plan.clone()], ..EngineConfig::default() };
    let tooling = MigrationTooling::new(Arc::clone(&store), Arc::clone(&registry), config)?;

    let summary = tooling.run_backfill(100, 0)?;
    println!("✓ Backfill: {} migrated, {} failed", summary.migrated, summary.failed);
    let report = tooling.verify(Sample::All)?;
    println!(
        "✓ Verified {} rows, pass rate {:.0}%\n",
        report.checked,
        report.pass_rate() * 100.0
    );

    // Rotate, drain, retire
    let v2 = source.generate("v2")?;
    let handle = tooling.rotate("v2", v2.expose_secret().clone())?;
    source.set_current("v2")?;
    println!("✓ Rotated {} -> {}", handle.from(), handle.to());

    let drained = tooling.drain(&handle, 100)?;
    println!("✓ Drained {} rows", drained.migrated);
    tooling.retire("v1")?;
    source.destroy("v1")?;
    println!("✓ Retired v1\n");

    let row = store.get_text("clients", 3, "date_of_birth_enc").unwrap_or_default();
    println!("Row 3 is now under {}", peek_version(&row).unwrap_or("?"));

    println!("=============================");
    println!("All operations successful!");
    Ok(())
}
