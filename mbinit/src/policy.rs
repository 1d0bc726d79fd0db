//! Access-policy text patch.
//!
//! Appends static blocks to the platform's `init.rc` and `file_contexts` so
//! init waits for coldboot and relabels the private tree. Best effort: a
//! missing target file is skipped.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use mbinit_shared::errors::MbResult;
use mbinit_shared::MultibootLayout;

use crate::context::BootMode;

const COLDBOOT_WAIT: &str = "\n\non early-init\n    wait /dev/.coldboot_done\n\n";

const DATA_LAYOUT_RESTORECON: &str =
    "\n\non post-fs-data\n    restorecon /data/.layout_version\n\n";

pub struct PolicyPatcher<'a> {
    system_root: PathBuf,
    layout: &'a MultibootLayout,
}

impl<'a> PolicyPatcher<'a> {
    pub fn new(system_root: impl Into<PathBuf>, layout: &'a MultibootLayout) -> Self {
        Self {
            system_root: system_root.into(),
            layout,
        }
    }

    fn init_rc(&self) -> PathBuf {
        self.system_root.join("init.rc")
    }

    fn file_contexts(&self) -> PathBuf {
        self.system_root.join("file_contexts")
    }

    /// Apply the patch for `mode`. Returns the number of blocks appended.
    pub fn apply(&self, mode: BootMode) -> MbResult<usize> {
        let mut appended = 0;

        appended += append(&self.init_rc(), COLDBOOT_WAIT)? as usize;
        if mode.recovery {
            return Ok(appended);
        }

        if mode.multiboot {
            appended += append(&self.init_rc(), DATA_LAYOUT_RESTORECON)? as usize;
        }
        appended += append(&self.file_contexts(), &self.file_contexts_block())? as usize;
        appended += append(&self.init_rc(), &self.restorecon_block())? as usize;

        tracing::debug!(appended, "Patched access policy");
        Ok(appended)
    }

    fn file_contexts_block(&self) -> String {
        let root = self.layout.root().display();
        format!(
            "\n\n\
             {root}(/.*)?               u:object_r:rootfs:s0\n\
             {root}/dev(/.*)?           u:object_r:device:s0\n\
             {root}/dev/null            u:object_r:null_device:s0\n\
             {root}/dev/zero            u:object_r:zero_device:s0\n\
             {root}/dev/block(/.*)?     u:object_r:block_device:s0\n\
             /data/media/multiboot(/.*)?          <<none>>\n\
             /data/media/0/multiboot(/.*)?        <<none>>\n\
             /realdata/media/multiboot(/.*)?      <<none>>\n\
             /realdata/media/0/multiboot(/.*)?    <<none>>\n"
        )
    }

    fn restorecon_block(&self) -> String {
        let root = self.layout.root().display();
        format!(
            "\n\non early-init\n    restorecon {root}\n    restorecon_recursive {root}/dev\n\n"
        )
    }
}

/// Append `text` to an existing file. Returns false when the file is missing.
fn append(path: &Path, text: &str) -> MbResult<bool> {
    let mut file = match OpenOptions::new().append(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Policy file missing, skipping");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(text.as_bytes())?;
    Ok(true)
}
