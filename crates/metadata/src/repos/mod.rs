//! Repository traits for metadata operations.

pub mod disks;
pub mod download_tasks;
pub mod files;
pub mod groups;
pub mod paths;
pub mod recycle;
pub mod shares;
pub mod upload_tasks;
pub mod user_files;
pub mod users;

pub use disks::DiskRepo;
pub use download_tasks::DownloadTaskRepo;
pub use files::FileRepo;
pub use groups::GroupRepo;
pub use paths::VirtualPathRepo;
pub use recycle::RecycleRepo;
pub use shares::ShareRepo;
pub use upload_tasks::UploadTaskRepo;
pub use user_files::UserFileRepo;
pub use users::UserRepo;
