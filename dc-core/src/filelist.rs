//! `files.xml.bz2` generation from the share index.

use std::collections::BTreeMap;
use std::io::{self, Write};

use bzip2::write::BzEncoder;
use bzip2::Compression;
use rand::Rng;

use crate::share::{ShareIndex, SEPARATOR};
use crate::tth::TthValue;

pub const GENERATOR: &str = concat!("dcpp ", env!("CARGO_PKG_VERSION"));

/// Random client id: 24 bytes, base32.
pub fn make_cid<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 24];
    rng.fill(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes)
}

#[derive(Default)]
struct Dir {
    name: String,
    dirs: BTreeMap<String, Dir>,
    files: BTreeMap<String, (String, u64, TthValue)>,
}

impl Dir {
    fn insert(&mut self, parts: &[&str], size: u64, tth: TthValue) {
        match parts {
            [] => {}
            [file] => {
                self.files
                    .insert(file.to_lowercase(), (file.to_string(), size, tth));
            }
            [dir, rest @ ..] => {
                let child = self.dirs.entry(dir.to_lowercase()).or_insert_with(|| Dir {
                    name: dir.to_string(),
                    ..Dir::default()
                });
                child.insert(rest, size, tth);
            }
        }
    }

    fn write(&self, out: &mut String, depth: usize) {
        for dir in self.dirs.values() {
            indent(out, depth);
            out.push_str(&format!("<Directory Name=\"{}\">\n", xml_escape(&dir.name)));
            dir.write(out, depth + 1);
            indent(out, depth);
            out.push_str("</Directory>\n");
        }
        for (name, size, tth) in self.files.values() {
            indent(out, depth);
            out.push_str(&format!(
                "<File Name=\"{}\" Size=\"{}\" TTH=\"{}\"/>\n",
                xml_escape(name),
                size,
                tth
            ));
        }
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Listing of every hashed file. Unhashed files are not offered yet.
pub fn generate_xml(share: &ShareIndex, cid: &str) -> String {
    let mut root = Dir::default();
    for entry in share.entries() {
        if let Some(tth) = entry.tth {
            let parts: Vec<&str> = entry
                .virtual_path
                .split(SEPARATOR)
                .filter(|p| !p.is_empty())
                .collect();
            root.insert(&parts, entry.size, tth);
        }
    }
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
    out.push_str(&format!(
        "<FileListing Version=\"1\" CID=\"{}\" Base=\"/\" Generator=\"{}\">\n",
        xml_escape(cid),
        xml_escape(GENERATOR)
    ));
    root.write(&mut out, 1);
    out.push_str("</FileListing>\n");
    out
}

/// `files.xml.bz2` bytes.
pub fn generate(share: &ShareIndex, cid: &str) -> io::Result<Vec<u8>> {
    let mut enc = BzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(generate_xml(share, cid).as_bytes())?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::leaf_hash;
    use std::io::Read;
    use std::path::{Path, PathBuf};

    fn share() -> ShareIndex {
        let mut s = ShareIndex::new();
        s.add_root("Music", PathBuf::from("/m")).unwrap();
        for (v, r, h) in [
            ("Music\\Rock & Roll\\a.mp3", "/m/Rock & Roll/a.mp3", Some(leaf_hash(b"a"))),
            ("Music\\b <live>.mp3", "/m/b <live>.mp3", Some(leaf_hash(b"b"))),
            ("Music\\pending.mp3", "/m/pending.mp3", None),
        ] {
            s.upsert_file(v.into(), r.into(), 10, 1);
            if let Some(h) = h {
                s.set_tth(Path::new(r), 10, 1, h);
            }
        }
        s
    }

    #[test]
    fn nested_and_escaped() {
        let xml = generate_xml(&share(), "CID123");
        assert!(xml.contains("<FileListing Version=\"1\" CID=\"CID123\" Base=\"/\""));
        assert!(xml.contains("<Directory Name=\"Music\">"));
        assert!(xml.contains("<Directory Name=\"Rock &amp; Roll\">"));
        assert!(xml.contains(&format!(
            "<File Name=\"a.mp3\" Size=\"10\" TTH=\"{}\"/>",
            leaf_hash(b"a")
        )));
        assert!(xml.contains("b &lt;live&gt;.mp3"));
        assert!(!xml.contains("pending.mp3"));
        // Subdirectory closes before the sibling file.
        let rock = xml.find("Rock").unwrap();
        let b = xml.find("b &lt;").unwrap();
        assert!(rock < b);
    }

    #[test]
    fn compressed_listing_decodes() {
        let bytes = generate(&share(), "X").unwrap();
        assert_eq!(&bytes[..3], b"BZh");
        let mut xml = String::new();
        bzip2::read::BzDecoder::new(&bytes[..])
            .read_to_string(&mut xml)
            .unwrap();
        assert_eq!(xml, generate_xml(&share(), "X"));
    }

    #[test]
    fn cid_is_base32() {
        let cid = make_cid(&mut rand::thread_rng());
        assert_eq!(cid.len(), 39);
        assert!(cid.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
    }
}
