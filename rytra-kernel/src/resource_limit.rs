// SPDX-FileCopyrightText: 2026 rytra contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Resource categories tracked by a resource limit, in guest ABI order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceType {
    Priority = 0,
    Commit = 1,
    Thread = 2,
    Event = 3,
    Mutex = 4,
    Semaphore = 5,
    Timer = 6,
    SharedMemory = 7,
    AddressArbiter = 8,
    CpuTime = 9,
}

pub const RESOURCE_TYPE_COUNT: usize = 10;

/// Resource limit categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceLimitCategory {
    Application = 0,
    SysApplet = 1,
    LibApplet = 2,
    Other = 3,
}

/// Per-category caps on kernel resource usage.
pub struct ResourceLimit {
    pub category: ResourceLimitCategory,
    pub name: String,
    /// Maximum allowed value per resource type. For Priority this is the
    /// numerically lowest (= best) priority the holder may request.
    pub limit_values: [i32; RESOURCE_TYPE_COUNT],
    /// Current usage per resource type.
    pub current_values: [i32; RESOURCE_TYPE_COUNT],
}

impl ResourceLimit {
    /// The limit set handed to regular applications.
    pub fn application() -> Self {
        let mut limit_values = [0i32; RESOURCE_TYPE_COUNT];
        limit_values[ResourceType::Priority as usize] = 0x18;
        limit_values[ResourceType::Commit as usize] = 0x0400_0000;
        limit_values[ResourceType::Thread as usize] = 0x20;
        limit_values[ResourceType::Event as usize] = 0x20;
        limit_values[ResourceType::Mutex as usize] = 0x20;
        limit_values[ResourceType::Semaphore as usize] = 0x08;
        limit_values[ResourceType::Timer as usize] = 0x08;
        limit_values[ResourceType::SharedMemory as usize] = 0x10;
        limit_values[ResourceType::AddressArbiter as usize] = 0x02;
        limit_values[ResourceType::CpuTime as usize] = 0x0;
        Self {
            category: ResourceLimitCategory::Application,
            name: "applications".into(),
            limit_values,
            current_values: [0; RESOURCE_TYPE_COUNT],
        }
    }

    pub fn max_resource_value(&self, resource: u32) -> i32 {
        self.limit_values
            .get(resource as usize)
            .copied()
            .unwrap_or_else(|| {
                log::error!("resource limit query for unknown resource {resource}");
                0
            })
    }

    pub fn current_resource_value(&self, resource: u32) -> i32 {
        self.current_values
            .get(resource as usize)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_limits() {
        let limit = ResourceLimit::application();
        assert_eq!(limit.max_resource_value(ResourceType::Priority as u32), 0x18);
        assert_eq!(limit.max_resource_value(ResourceType::Thread as u32), 0x20);
        assert_eq!(limit.current_resource_value(ResourceType::Thread as u32), 0);
        // Unknown resources read as zero.
        assert_eq!(limit.max_resource_value(42), 0);
    }
}
