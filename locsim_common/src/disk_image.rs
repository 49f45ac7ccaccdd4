//! On-disk layout of downloaded developer disk images:
//! `<root>/<product-name>/<version>/DeveloperDiskImage.dmg` plus its support files.

use std::{
    cmp::Ordering,
    io,
    path::{Path, PathBuf},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportFile {
    Image,
    Signature,
    Trustcache,
    BuildManifest,
}

impl SupportFile {
    pub fn file_name(self) -> &'static str {
        match self {
            SupportFile::Image => "DeveloperDiskImage.dmg",
            SupportFile::Signature => "DeveloperDiskImage.dmg.signature",
            SupportFile::Trustcache => "DeveloperDiskImage.dmg.trustcache",
            SupportFile::BuildManifest => "BuildManifest.plist",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePaths {
    pub image: PathBuf,
    pub signature: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DiskImageStore {
    root: PathBuf,
}

impl DiskImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, os: &str, version: &str) -> PathBuf {
        self.root.join(os).join(version)
    }

    pub fn file(&self, os: &str, version: &str, file: SupportFile) -> PathBuf {
        self.version_dir(os, version).join(file.file_name())
    }

    fn has(&self, os: &str, version: &str, files: &[SupportFile]) -> bool {
        check_location(os, version).is_ok()
            && files.iter().all(|f| self.file(os, version, *f).is_file())
    }

    pub fn has_image_files(&self, os: &str, version: &str) -> bool {
        self.has(os, version, &[SupportFile::Image, SupportFile::Signature])
    }

    pub fn has_personalized_files(&self, os: &str, version: &str) -> bool {
        self.has(
            os,
            version,
            &[SupportFile::Image, SupportFile::Trustcache, SupportFile::BuildManifest],
        )
    }

    /// A version counts as installed when it holds at least one complete file set.
    pub fn is_installed(&self, os: &str, version: &str) -> bool {
        self.has_image_files(os, version) || self.has_personalized_files(os, version)
    }

    pub fn image_paths(&self, os: &str, version: &str) -> Option<ImagePaths> {
        self.has_image_files(os, version).then(|| ImagePaths {
            image: self.file(os, version, SupportFile::Image),
            signature: self.file(os, version, SupportFile::Signature),
        })
    }

    /// Installed versions for `os`, newest first.
    pub fn available_versions(&self, os: &str) -> io::Result<Vec<String>> {
        check_product_name(os)?;
        let dir = self.root.join(os);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_version_string(&name) && self.is_installed(os, &name) {
                versions.push(name);
            }
        }
        versions.sort_by(|a, b| compare_versions(b, a));
        Ok(versions)
    }

    /// Copies `source` into the layout, creating the version directory as needed.
    pub fn store(
        &self,
        os: &str,
        version: &str,
        file: SupportFile,
        source: &Path,
    ) -> io::Result<PathBuf> {
        check_location(os, version)?;
        let dir = self.version_dir(os, version);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(file.file_name());
        std::fs::copy(source, &target)?;
        tracing::info!("Stored {} for {} {}", file.file_name(), os, version);
        Ok(target)
    }

    pub fn remove(&self, os: &str, version: &str) -> io::Result<()> {
        check_location(os, version)?;
        let dir = self.version_dir(os, version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::info!("Removed developer disk image {} {}", os, version);
        }
        Ok(())
    }
}

/// A product name must stay a single path component below the root.
fn check_product_name(os: &str) -> io::Result<()> {
    if os.is_empty() || os == "." || os == ".." || os.contains(['/', '\\']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid product name {os:?}"),
        ));
    }
    Ok(())
}

fn check_location(os: &str, version: &str) -> io::Result<()> {
    check_product_name(os)?;
    if !is_version_string(version) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid version {version:?}"),
        ));
    }
    Ok(())
}

fn version_parts(version: &str) -> impl Iterator<Item = u32> + '_ {
    version.split('.').map(|part| part.parse().unwrap_or(0))
}

/// Numeric, component-wise comparison. Missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut a = version_parts(a);
    let mut b = version_parts(b);
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (x, y) => match x.unwrap_or(0).cmp(&y.unwrap_or(0)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

pub fn is_version_string(s: &str) -> bool {
    !s.is_empty()
        && s.split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}
