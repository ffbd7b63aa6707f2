//! Path joins against remote roots. Every join goes through here so that an
//! absolute path smuggled in as a "relative" component can never escape the
//! storage root.

use anyhow::bail;
use camino::{Utf8Path, Utf8PathBuf};

/// Join `relative` onto `root`, requiring `root` to be absolute and
/// `relative` to actually be relative.
pub fn check_append_path(root: &Utf8Path, relative: &str) -> anyhow::Result<Utf8PathBuf> {
    let relative = Utf8Path::new(relative);
    if relative.is_absolute() {
        bail!("please provide a relative path - relative path provided: {relative}");
    }
    if !root.is_absolute() {
        bail!("please provide an absolute path - absolute path provided: {root}");
    }
    Ok(root.join(relative))
}
