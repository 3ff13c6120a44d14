//! Running patch operations in a privilege-elevated copy of this program.
//!
//! The caller starts the helper with `-o <channel>` and waits on a local
//! socket for a single JSON message holding the helper's status report.

mod message;
mod process;
mod response_pipe;

pub use message::{write_message, MessageReader, MAX_MESSAGE_BYTES};
pub use process::{
    DirectLauncher, ElevatedProcess, ElevationLauncher, HelperHandle, HelperState, SystemLauncher, CONNECT_TIMEOUT,
};
pub use response_pipe::{ElevatedProcessResponsePipe, SENT_TIMEOUT};

use interprocess::local_socket::{GenericFilePath, GenericNamespaced, Name, NameType, ToFsName, ToNsName};

/// Socket name for a channel: namespaced where the platform has that,
/// a file in the temp directory otherwise.
pub(crate) fn socket_name(channel: &str) -> std::io::Result<Name<'static>> {
    if GenericNamespaced::is_supported() {
        format!("{}.sock", channel).to_ns_name::<GenericNamespaced>()
    } else {
        std::env::temp_dir()
            .join(format!("{}.sock", channel))
            .to_fs_name::<GenericFilePath>()
    }
}
