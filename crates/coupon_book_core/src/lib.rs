pub mod assignment;
pub mod books;
pub mod domain;
pub mod eligibility;
pub mod generation;
pub mod memory;
pub mod pattern;
pub mod ports;
pub mod redemption;

pub use assignment::AssignmentService;
pub use books::BookService;
pub use domain::{
    AssignmentDetail, BookStatus, BookUpdate, CodeFilter, CouponAssignment, CouponBook,
    CouponCode, CouponRedemption, CouponStatus, GenerationJob, GenerationOutcome,
    GenerationRequest, JobCounts, JobFilter, JobOptions, JobState, LockEntry, NewBook, Page,
    Paged, RedemptionDetail, RedemptionFilter, RedemptionSummary, Release, User,
};
pub use generation::{CodeGenerator, GenerateCodes, GenerationService, GeneratorSettings};
pub use ports::{
    Clock, CouponStore, JobQueue, LockCache, PortError, PortResult, ProgressSink, SystemClock,
};
pub use redemption::RedemptionService;
