//! Host-side filesystem helpers used by the node agent.

use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Size in bytes of the block device at `path`, via the `BLKGETSIZE64` ioctl.
pub fn block_device_size(path: &Path) -> anyhow::Result<u64> {
    let file = std::fs::File::open(path)?;
    let mut size: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }?;
    Ok(size)
}

/// All mount points strictly under `directory` that are top-level, i.e. not
/// themselves under any other mount point below `directory`.
pub fn find_top_level_mounts(directory: &Path) -> anyhow::Result<Vec<PathBuf>> {
    assert!(directory.is_absolute());
    let mount_info = std::fs::read_to_string("/proc/self/mountinfo")?;
    Ok(top_level_mounts_in(&mount_info, directory))
}

fn top_level_mounts_in(mount_info: &str, directory: &Path) -> Vec<PathBuf> {
    let under_directory: std::collections::BTreeSet<PathBuf> = mount_info
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(decode_mount_path)
        .filter(|point| point.starts_with(directory) && point.as_path() != directory)
        .collect();

    under_directory
        .iter()
        .filter(|point| {
            !under_directory
                .iter()
                .any(|other| other != *point && point.starts_with(other))
        })
        .cloned()
        .collect()
}

/// Decode the octal escapes (`\040` for space, ...) that mountinfo uses in
/// path fields.
fn decode_mount_path(field: &str) -> PathBuf {
    let raw = field.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut index = 0;
    while index < raw.len() {
        if raw[index] == b'\\' && index + 3 < raw.len() {
            let octal = &raw[index + 1..index + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = (octal[0] - b'0') * 64 + (octal[1] - b'0') * 8 + (octal[2] - b'0');
                bytes.push(value);
                index += 4;
                continue;
            }
        }
        bytes.push(raw[index]);
        index += 1;
    }
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    const MOUNT_INFO: &str = "\
25 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n\
91 25 0:42 / /var/lib/kubernetes-pav/vol-1/mnt rw shared:48 - fuse fuse rw\n\
92 91 0:43 / /var/lib/kubernetes-pav/vol-1/mnt/nested rw shared:49 - tmpfs tmpfs rw\n\
93 25 0:44 / /var/lib/kubernetes-pav/vol-1/other rw shared:50 - tmpfs tmpfs rw\n\
94 25 0:45 / /var/lib/kubernetes-pav/vol-2/mnt rw shared:51 - tmpfs tmpfs rw\n\
95 25 0:46 / /var/lib/kubernetes-pav/vol-1/with\\040space rw shared:52 - tmpfs tmpfs rw\n";

    #[test]
    fn only_top_level_mounts_are_returned() {
        let directory = Path::new("/var/lib/kubernetes-pav/vol-1");
        let mut mounts = top_level_mounts_in(MOUNT_INFO, directory);
        mounts.sort();
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/var/lib/kubernetes-pav/vol-1/mnt"),
                PathBuf::from("/var/lib/kubernetes-pav/vol-1/other"),
                PathBuf::from("/var/lib/kubernetes-pav/vol-1/with space"),
            ]
        );
    }

    #[test]
    fn the_directory_itself_is_not_a_result() {
        let directory = Path::new("/var/lib/kubernetes-pav/vol-2/mnt");
        assert!(top_level_mounts_in(MOUNT_INFO, directory).is_empty());
    }

    #[test]
    fn escaped_paths_are_decoded() {
        assert_eq!(
            decode_mount_path(r"/mnt/with\040space"),
            PathBuf::from("/mnt/with space")
        );
        assert_eq!(decode_mount_path("/plain"), PathBuf::from("/plain"));
        assert_eq!(
            decode_mount_path(r"/tab\011here"),
            PathBuf::from("/tab\there")
        );
    }
}
