//! 命令下发：写命令 -> 等待确认 -> 校验回显。
//!
//! 命令通道只使用已建立的主站连接，从不主动连接；未连接时直接失败，不发送任何字节。

use hmi_protocol::{MasterHandle, ProtocolError, RegisterValue, WriteCommand, WriteConfirm};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// 确认帧中与命令不一致的字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchField {
    Function,
    Address,
    /// 单个写：回显的数据
    Value,
    /// 批量写：回显的数量
    Quantity,
}

impl fmt::Display for MismatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MismatchField::Function => "function",
            MismatchField::Address => "address",
            MismatchField::Value => "value",
            MismatchField::Quantity => "quantity",
        };
        f.write_str(name)
    }
}

/// 确认回显与命令不一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("confirm {field} mismatch: expected {expected}, got {actual}")]
pub struct ConfirmMismatch {
    pub field: MismatchField,
    pub expected: u16,
    pub actual: u16,
}

/// 命令下发错误。
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("master connection not established")]
    NotConnected,
    #[error("value {0} is outside -32768..=65535")]
    OutOfRange(i32),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Mismatch(#[from] ConfirmMismatch),
}

/// 校验确认帧：功能码、起始地址，以及单个写的数据或批量写的数量。
pub fn verify_confirm(command: &WriteCommand, confirm: &WriteConfirm) -> Result<(), ConfirmMismatch> {
    let expected = command.expected_confirm();
    if confirm.function != expected.function {
        return Err(ConfirmMismatch {
            field: MismatchField::Function,
            expected: u16::from(expected.function.code()),
            actual: u16::from(confirm.function.code()),
        });
    }
    if confirm.address != expected.address {
        return Err(ConfirmMismatch {
            field: MismatchField::Address,
            expected: expected.address,
            actual: confirm.address,
        });
    }
    if confirm.value != expected.value {
        let field = match command {
            WriteCommand::SingleCoil { .. } | WriteCommand::SingleRegister { .. } => {
                MismatchField::Value
            }
            WriteCommand::MultipleCoils { .. } | WriteCommand::MultipleRegisters { .. } => {
                MismatchField::Quantity
            }
        };
        return Err(ConfirmMismatch {
            field,
            expected: expected.value,
            actual: confirm.value,
        });
    }
    Ok(())
}

/// 显示层传入的整数 -> 寄存器值：负数按有符号字，其余按无符号字。
pub fn encode_value(value: i32) -> Result<RegisterValue, CommandError> {
    RegisterValue::from_i32(value).ok_or(CommandError::OutOfRange(value))
}

/// 系统控制命令的寄存器地址。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAddresses {
    pub start: u16,
    pub stop: u16,
    pub reset: u16,
    pub maintenance: u16,
    pub examination: u16,
}

impl Default for ControlAddresses {
    fn default() -> Self {
        Self {
            start: 102,
            stop: 104,
            reset: 103,
            maintenance: 105,
            examination: 106,
        }
    }
}

/// 系统控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Start,
    Stop,
    Reset,
    /// 进入 / 退出维护
    Maintenance(bool),
    /// 进入 / 退出检修
    Examination(bool),
}

impl SystemCommand {
    pub fn address(self, addresses: &ControlAddresses) -> u16 {
        match self {
            SystemCommand::Start => addresses.start,
            SystemCommand::Stop => addresses.stop,
            SystemCommand::Reset => addresses.reset,
            SystemCommand::Maintenance(_) => addresses.maintenance,
            SystemCommand::Examination(_) => addresses.examination,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            SystemCommand::Start | SystemCommand::Stop | SystemCommand::Reset => 1,
            SystemCommand::Maintenance(on) | SystemCommand::Examination(on) => u16::from(on),
        }
    }

    pub fn to_command(self, addresses: &ControlAddresses) -> WriteCommand {
        WriteCommand::SingleRegister {
            address: self.address(addresses),
            value: RegisterValue::Unsigned(self.value()),
        }
    }
}

/// 写命令下发器。
#[derive(Clone)]
pub struct CommandSender {
    handle: Arc<MasterHandle>,
    addresses: ControlAddresses,
}

impl CommandSender {
    pub fn new(handle: Arc<MasterHandle>) -> Self {
        Self {
            handle,
            addresses: ControlAddresses::default(),
        }
    }

    pub fn with_addresses(mut self, addresses: ControlAddresses) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn addresses(&self) -> &ControlAddresses {
        &self.addresses
    }

    /// 下发写命令并校验确认。
    pub async fn try_write(&self, command: WriteCommand) -> Result<WriteConfirm, CommandError> {
        let address = command.address();
        let function = command.function();
        let Some(connection) = self.handle.current() else {
            hmi_telemetry::record_command_rejected();
            warn!(target: "hmi.control", address, function = %function, command = ?command, "command_not_connected");
            return Err(CommandError::NotConnected);
        };

        let confirm = match connection.write(&command).await {
            Ok(confirm) => confirm,
            Err(e) => {
                if e.is_connection_loss() {
                    self.handle.invalidate();
                }
                hmi_telemetry::record_command_rejected();
                warn!(
                    target: "hmi.control",
                    address,
                    function = %function,
                    command = ?command,
                    retriable = e.is_retriable(),
                    error = %e,
                    "command_failed"
                );
                return Err(e.into());
            }
        };

        if let Err(mismatch) = verify_confirm(&command, &confirm) {
            hmi_telemetry::record_command_rejected();
            warn!(
                target: "hmi.control",
                address,
                function = %function,
                command = ?command,
                confirm = ?confirm,
                error = %mismatch,
                "command_confirm_mismatch"
            );
            return Err(mismatch.into());
        }

        hmi_telemetry::record_command_confirmed();
        info!(target: "hmi.control", address, function = %function, value = confirm.value, "command_confirmed");
        Ok(confirm)
    }

    /// 单寄存器写（功能码 6）
    pub async fn try_send_command(
        &self,
        address: u16,
        value: RegisterValue,
    ) -> Result<WriteConfirm, CommandError> {
        self.try_write(WriteCommand::SingleRegister { address, value })
            .await
    }

    /// 多寄存器写（功能码 16）
    pub async fn try_send_commands(
        &self,
        address: u16,
        values: Vec<RegisterValue>,
    ) -> Result<WriteConfirm, CommandError> {
        self.try_write(WriteCommand::MultipleRegisters { address, values })
            .await
    }

    /// 单线圈写（功能码 5）
    pub async fn try_send_coil(&self, address: u16, value: bool) -> Result<WriteConfirm, CommandError> {
        self.try_write(WriteCommand::SingleCoil { address, value })
            .await
    }

    /// 多线圈写（功能码 15）
    pub async fn try_send_coils(
        &self,
        address: u16,
        values: Vec<bool>,
    ) -> Result<WriteConfirm, CommandError> {
        self.try_write(WriteCommand::MultipleCoils { address, values })
            .await
    }

    pub async fn try_system(&self, command: SystemCommand) -> Result<WriteConfirm, CommandError> {
        info!(target: "hmi.control", command = ?command, "system_command_requested");
        self.try_write(command.to_command(&self.addresses)).await
    }

    pub async fn send_command(&self, address: u16, value: RegisterValue) -> bool {
        self.try_send_command(address, value).await.is_ok()
    }

    pub async fn send_commands(&self, address: u16, values: Vec<RegisterValue>) -> bool {
        self.try_send_commands(address, values).await.is_ok()
    }

    pub async fn send_coil(&self, address: u16, value: bool) -> bool {
        self.try_send_coil(address, value).await.is_ok()
    }

    pub async fn send_coils(&self, address: u16, values: Vec<bool>) -> bool {
        self.try_send_coils(address, values).await.is_ok()
    }

    pub async fn send_system(&self, command: SystemCommand) -> bool {
        self.try_system(command).await.is_ok()
    }

    /// 显示层入口：整数值写入单个寄存器。
    pub async fn send_value(&self, address: u16, value: i32) -> bool {
        match encode_value(value) {
            Ok(value) => self.send_command(address, value).await,
            Err(e) => {
                hmi_telemetry::record_command_rejected();
                warn!(target: "hmi.control", address, value, error = %e, "command_value_rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmi_protocol::FunctionCode;

    #[test]
    fn matching_confirm_passes() {
        let command = WriteCommand::SingleRegister {
            address: 102,
            value: RegisterValue::Unsigned(1),
        };
        assert_eq!(verify_confirm(&command, &command.expected_confirm()), Ok(()));
    }

    #[test]
    fn mismatched_fields_reported() {
        let command = WriteCommand::SingleRegister {
            address: 102,
            value: RegisterValue::Unsigned(1),
        };
        let mut confirm = command.expected_confirm();
        confirm.address = 103;
        assert_eq!(
            verify_confirm(&command, &confirm).unwrap_err().field,
            MismatchField::Address
        );

        let mut confirm = command.expected_confirm();
        confirm.value = 0;
        assert_eq!(
            verify_confirm(&command, &confirm).unwrap_err().field,
            MismatchField::Value
        );

        let mut confirm = command.expected_confirm();
        confirm.function = FunctionCode::WriteMultipleRegisters;
        assert_eq!(
            verify_confirm(&command, &confirm).unwrap_err().field,
            MismatchField::Function
        );
    }

    #[test]
    fn multiple_write_checks_quantity() {
        let command = WriteCommand::MultipleRegisters {
            address: 10,
            values: vec![RegisterValue::Unsigned(1), RegisterValue::Unsigned(2)],
        };
        let mut confirm = command.expected_confirm();
        assert_eq!(confirm.value, 2);
        confirm.value = 1;
        let mismatch = verify_confirm(&command, &confirm).unwrap_err();
        assert_eq!(mismatch.field, MismatchField::Quantity);
        assert_eq!(mismatch.to_string(), "confirm quantity mismatch: expected 2, got 1");
    }

    #[test]
    fn system_commands_use_control_addresses() {
        let addresses = ControlAddresses::default();
        assert_eq!(SystemCommand::Start.address(&addresses), 102);
        assert_eq!(SystemCommand::Reset.address(&addresses), 103);
        assert_eq!(SystemCommand::Stop.address(&addresses), 104);
        assert_eq!(SystemCommand::Maintenance(false).value(), 0);
        assert_eq!(SystemCommand::Examination(true).value(), 1);
        assert_eq!(
            SystemCommand::Examination(true).to_command(&addresses),
            WriteCommand::SingleRegister {
                address: 106,
                value: RegisterValue::Unsigned(1)
            }
        );
    }

    #[test]
    fn value_encoding_range() {
        assert_eq!(encode_value(-1).unwrap(), RegisterValue::Signed(-1));
        assert_eq!(encode_value(65535).unwrap(), RegisterValue::Unsigned(65535));
        assert!(matches!(encode_value(65536), Err(CommandError::OutOfRange(65536))));
        assert!(matches!(encode_value(-32769), Err(CommandError::OutOfRange(_))));
    }
}
