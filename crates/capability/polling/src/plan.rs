//! 采集计划：点表分组 -> 按组排列的读请求。

use crate::error::PollError;
use domain::{GroupDescriptor, PointLocation, PolledValue};
use hmi_protocol::{
    DataType, FunctionCode, MasterConnection, PointValue, ProtocolError, RegisterValue,
    RequestDescriptor, RequestSplitter,
};
use tracing::{debug, warn};

/// 采集目标：从站号、默认读功能码与点表分组。
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub slave_id: u8,
    pub function: FunctionCode,
    pub groups: Vec<GroupDescriptor>,
}

impl PollTarget {
    /// 默认读输入寄存器（功能码 4）。
    pub fn new(slave_id: u8, groups: Vec<GroupDescriptor>) -> Self {
        Self {
            slave_id,
            function: FunctionCode::ReadInputRegisters,
            groups,
        }
    }

    pub fn with_function(mut self, function: FunctionCode) -> Self {
        self.function = function;
        self
    }
}

/// 点位配置 -> 寄存器解码方式。
pub fn data_type_of(location: &PointLocation) -> DataType {
    if location.is_signed() {
        DataType::Signed
    } else if location.is_bitfield() {
        DataType::Bitfield
    } else {
        DataType::Unsigned
    }
}

/// 解码值 -> 发布值。线圈映射为 0/1。
pub fn polled_value(value: PointValue) -> PolledValue {
    match value {
        PointValue::Register(RegisterValue::Unsigned(word)) => PolledValue::Number(i64::from(word)),
        PointValue::Register(RegisterValue::Signed(word)) => PolledValue::Number(i64::from(word)),
        PointValue::Register(bitfield @ RegisterValue::Bitfield(_)) => {
            PolledValue::Bits(bitfield.bits().to_vec())
        }
        PointValue::Coil(on) => PolledValue::Number(i64::from(on)),
    }
}

/// 单个分组的请求序列。分组内任一请求失败，整组结果丢弃。
#[derive(Debug, Clone)]
pub struct PollGroup {
    index: u32,
    function: FunctionCode,
    requests: Vec<RequestDescriptor>,
}

impl PollGroup {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn requests(&self) -> &[RequestDescriptor] {
        &self.requests
    }

    /// 依次发出本组请求（严格串行）。
    pub async fn poll(
        &self,
        connection: &MasterConnection,
    ) -> Result<Vec<(u16, PolledValue)>, ProtocolError> {
        let mut values = Vec::new();
        for request in &self.requests {
            let response = connection.read(request).await?;
            values.extend(
                request
                    .decode_values(&response)?
                    .into_iter()
                    .map(|(address, value)| (address, polled_value(value))),
            );
        }
        Ok(values)
    }
}

/// 按分组序号排列的完整采集计划。
#[derive(Debug, Clone, Default)]
pub struct PollPlan {
    groups: Vec<PollGroup>,
}

impl PollPlan {
    pub fn build(target: &PollTarget) -> Result<Self, PollError> {
        let splitter = RequestSplitter::new(target.slave_id);
        let mut descriptors: Vec<&GroupDescriptor> = target.groups.iter().collect();
        descriptors.sort_by_key(|group| group.index);

        let mut groups = Vec::with_capacity(descriptors.len());
        for group in descriptors {
            for location in group.out_of_range() {
                warn!(
                    target: "hmi.polling",
                    group = group.index,
                    address = location.address,
                    start = group.start,
                    end = group.end,
                    "location_out_of_group_range"
                );
            }

            let function = match group.function_code {
                Some(code) => FunctionCode::try_from(code).map_err(PollError::Plan)?,
                None => target.function,
            };
            let requests = if function.is_bit_access() {
                let addresses: Vec<u16> = group.monitored().map(|l| l.address).collect();
                splitter.split_coils(function, &addresses)
            } else {
                let points: Vec<(u16, DataType)> = group
                    .monitored()
                    .map(|location| (location.address, data_type_of(location)))
                    .collect();
                splitter.split_registers(function, &points)
            }
            .map_err(PollError::Plan)?;

            if requests.is_empty() {
                debug!(target: "hmi.polling", group = group.index, "empty_group_skipped");
                continue;
            }
            groups.push(PollGroup {
                index: group.index,
                function,
                requests,
            });
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[PollGroup] {
        &self.groups
    }

    pub fn request_count(&self) -> usize {
        self.groups.iter().map(|group| group.requests.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
