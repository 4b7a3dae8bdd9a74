#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Detecting,
    Writing,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub fov: u32,
    pub worker_id: usize,
    pub phase: Phase,
}

impl WorkerStatus {
    pub fn new(progress: f32, fov: u32, worker_id: usize, phase: Phase) -> Self {
        Self {
            progress,
            fov,
            worker_id,
            phase,
        }
    }
}
