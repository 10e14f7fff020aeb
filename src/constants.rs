// Environment variables injected into every training container.
pub const ENV_JOB_ID: &str = "JOB_ID";
pub const ENV_PROJECT_ID: &str = "PROJECT_ID";
pub const ENV_MODEL_NAME: &str = "MODEL_NAME";
pub const ENV_DATASET_PATH: &str = "DATASET_PATH";
pub const ENV_OUTPUT_PATH: &str = "OUTPUT_PATH";
pub const ENV_HYPERPARAMETERS: &str = "HYPERPARAMETERS";
pub const ENV_NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
pub const ENV_CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Prefix for hyperparameters flattened into the container environment.
pub const HYPERPARAMETER_ENV_PREFIX: &str = "HP_";

// In-container mount points.
pub const DATASET_MOUNT_PATH: &str = "/data";
pub const OUTPUT_MOUNT_PATH: &str = "/output";
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

// Container labels used to find our containers back (orphan stop, discovery).
pub const LABEL_JOB_ID: &str = "modelforge.io/job-id";
pub const LABEL_JOB_NAME: &str = "modelforge.io/job-name";
pub const LABEL_PROJECT_ID: &str = "modelforge.io/project-id";
pub const LABEL_FRAMEWORK: &str = "modelforge.io/framework";

// Default images per declared framework when the request leaves image blank.
pub const DEFAULT_PYTORCH_IMAGE: &str = "pytorch:latest";
pub const DEFAULT_TENSORFLOW_IMAGE: &str = "tensorflow:latest-gpu";
pub const DEFAULT_GENERIC_IMAGE: &str = "python:3.9";
