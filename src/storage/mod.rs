pub mod page;
pub mod page_cache;
pub mod page_file;
pub mod slotted;

pub use page::{MetaPage, PageCategory, PageHeader, PAGE_HEADER_SIZE};
pub use page_cache::PageCache;
pub use page_file::PageFile;
pub use slotted::{SlottedPage, SlottedPageMut};
