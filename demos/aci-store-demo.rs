//! Minimal end-to-end walkthrough of the store: write an ACI, read it
//! back, render a single-entry tree, and dump the index.
//!
//! Run with a scratch directory as the only argument:
//!
//! ```text
//! aci-store-demo /tmp/aci-demo-store
//! ```

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use aci_cas::{BlobStore, ImageRegistry, Label, RenderedAci, TreeRenderer, UidRange};

struct SingleEntryRegistry {
    key: String,
    file_map: HashSet<PathBuf>,
}

impl ImageRegistry for SingleEntryRegistry {
    fn get_rendered_by_id(&self, _key: &str) -> aci_cas::Result<Vec<RenderedAci>> {
        Ok(vec![RenderedAci::new(self.key.clone(), self.file_map.clone())])
    }

    fn get_rendered_by_name_and_labels(
        &self,
        _name: &str,
        _labels: &[Label],
    ) -> aci_cas::Result<Vec<RenderedAci>> {
        Ok(vec![RenderedAci::new(self.key.clone(), self.file_map.clone())])
    }

    fn get_rendered_from_list(&self, _images: &[String]) -> aci_cas::Result<Vec<RenderedAci>> {
        Ok(vec![RenderedAci::new(self.key.clone(), self.file_map.clone())])
    }
}

fn build_demo_aci() -> Vec<u8> {
    let manifest = serde_json::json!({
        "name": "example.com/hello",
        "labels": [{"name": "version", "value": "1.0"}],
    });
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "manifest", &manifest_bytes[..]).unwrap();

    let payload = b"hello from the demo aci\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "rootfs/hello.txt", &payload[..]).unwrap();

    builder.into_inner().unwrap()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let base = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: aci-store-demo <store-dir>"))?;

    let store = BlobStore::open(&base)?;
    let paths = store.paths().clone();

    let archive = build_demo_aci();
    let key = store.write_aci(Cursor::new(archive), true)?;
    println!("wrote image as {}", key);

    let manifest = store.get_image_manifest(&key)?;
    println!("manifest name: {}", manifest.name);

    let resolved = store.get_aci("example.com/hello", &[])?;
    assert_eq!(resolved, key);
    println!("resolved by name+latest: {}", resolved);

    let mut bytes = Vec::new();
    store.read_stream(&key)?.read_to_end(&mut bytes)?;
    println!("read back {} bytes", bytes.len());

    let registry = SingleEntryRegistry {
        key: key.clone(),
        file_map: HashSet::from([PathBuf::from("rootfs/hello.txt")]),
    };
    let renderer = TreeRenderer::new(&store, &paths);
    let root_fs = renderer.render_tree_store(&key, &registry, &UidRange::identity(), false)?;
    println!("rendered tree at {:?}", root_fs);

    let dump = store.dump()?;
    println!("index dump: {}", serde_json::to_string_pretty(&dump)?);

    Ok(())
}
