//! 请求拆分：把稀疏的地址集合切成满足单次数量上限的连续区间请求
//!
//! 地址按升序贪心合并，同样的输入永远得到同样的批次。区间以最后一个配置地址结束，
//! 中间未配置的空洞被一并读取但不解码。

use crate::codec::DataType;
use crate::error::ProtocolError;
use crate::function_code::FunctionCode;
use crate::request::RequestDescriptor;
use std::collections::BTreeMap;

/// 拆分策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    /// 单个请求覆盖的最大地址跨度
    pub max_quantity: u16,
    /// 相邻两个配置地址之间允许的最大空洞，超过则另起一个请求
    pub max_gap: Option<u16>,
}

impl SplitPolicy {
    /// 协议上限：寄存器 125，线圈 2000
    pub fn for_function(function: FunctionCode) -> Self {
        Self {
            max_quantity: function.max_read_quantity().unwrap_or(1),
            max_gap: None,
        }
    }

    pub fn with_max_quantity(mut self, max_quantity: u16) -> Self {
        self.max_quantity = max_quantity;
        self
    }

    pub fn with_max_gap(mut self, max_gap: u16) -> Self {
        self.max_gap = Some(max_gap);
        self
    }
}

/// 请求拆分器
#[derive(Debug, Clone, Copy)]
pub struct RequestSplitter {
    slave_id: u8,
    policy: Option<SplitPolicy>,
}

impl RequestSplitter {
    pub fn new(slave_id: u8) -> Self {
        Self {
            slave_id,
            policy: None,
        }
    }

    /// 覆盖默认（协议上限）的拆分策略
    pub fn with_policy(mut self, policy: SplitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn effective_policy(&self, function: FunctionCode) -> Result<SplitPolicy, ProtocolError> {
        let ceiling = function.max_read_quantity().ok_or_else(|| {
            ProtocolError::InvalidRequest(format!("{function} is not a read function"))
        })?;
        let mut policy = self
            .policy
            .unwrap_or_else(|| SplitPolicy::for_function(function));
        if policy.max_quantity == 0 {
            return Err(ProtocolError::InvalidRequest(
                "max quantity must be at least 1".into(),
            ));
        }
        policy.max_quantity = policy.max_quantity.min(ceiling);
        Ok(policy)
    }

    /// 寄存器点位拆分；重复地址保留第一次出现的数据类型。
    pub fn split_registers(
        &self,
        function: FunctionCode,
        points: &[(u16, DataType)],
    ) -> Result<Vec<RequestDescriptor>, ProtocolError> {
        let policy = self.effective_policy(function)?;
        let mut unique = BTreeMap::new();
        for (address, data_type) in points {
            unique.entry(*address).or_insert(*data_type);
        }
        let points: Vec<(u16, DataType)> = unique.into_iter().collect();
        let addresses: Vec<u16> = points.iter().map(|(address, _)| *address).collect();
        spans(&addresses, policy)
            .into_iter()
            .map(|(begin, end)| {
                RequestDescriptor::registers(self.slave_id, function, points[begin..end].to_vec())
            })
            .collect()
    }

    /// 线圈/离散输入拆分。
    pub fn split_coils(
        &self,
        function: FunctionCode,
        addresses: &[u16],
    ) -> Result<Vec<RequestDescriptor>, ProtocolError> {
        let policy = self.effective_policy(function)?;
        let mut addresses = addresses.to_vec();
        addresses.sort_unstable();
        addresses.dedup();
        spans(&addresses, policy)
            .into_iter()
            .map(|(begin, end)| {
                RequestDescriptor::coils(self.slave_id, function, addresses[begin..end].to_vec())
            })
            .collect()
    }
}

/// 升序地址上的贪心切分，返回下标区间 `[begin, end)`。
fn spans(addresses: &[u16], policy: SplitPolicy) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    if addresses.is_empty() {
        return out;
    }
    let mut begin = 0;
    for i in 1..addresses.len() {
        let span = u32::from(addresses[i] - addresses[begin]) + 1;
        let gap = addresses[i] - addresses[i - 1] - 1;
        let too_wide = span > u32::from(policy.max_quantity);
        let too_sparse = policy.max_gap.is_some_and(|max_gap| gap > max_gap);
        if too_wide || too_sparse {
            out.push((begin, i));
            begin = i;
        }
    }
    out.push((begin, addresses.len()));
    out
}
