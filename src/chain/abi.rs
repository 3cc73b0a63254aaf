//! Contract bindings for the protocol contracts.
//!
//! Minimal ABIs covering just the events the watchers decode and the view
//! functions the reconciler, vote-power processor and allocation engine read.
//! Topic0 hashes come from `SolEvent::SIGNATURE_HASH`.

use alloy::sol;

sol! {
    #![sol(all_derives)]

    /// Canonical task struct returned by `TaskMarket.getTask`.
    #[sol(all_derives)]
    struct TaskView {
        address creator;
        address worker;
        uint256 reward;
        uint64 deadline;
        uint8 status;
    }

    /// Canonical proposal struct returned by `Governor.getProposal`.
    #[sol(all_derives)]
    struct ProposalView {
        address proposer;
        uint64 startTime;
        uint64 endTime;
        uint256 forVotes;
        uint256 againstVotes;
        uint256 abstainVotes;
        uint8 state;
    }

    #[sol(all_derives)]
    interface ITaskMarket {
        event TaskCreated(uint256 indexed taskId, address indexed creator, uint256 reward, uint64 deadline);
        event TaskAssigned(uint256 indexed taskId, address indexed worker);
        event TaskSubmitted(uint256 indexed taskId, address indexed worker);
        event TaskCompleted(uint256 indexed taskId, address indexed worker, uint256 payout);
        event TaskCancelled(uint256 indexed taskId);

        function getTask(uint256 taskId) external view returns (TaskView memory);
    }

    #[sol(all_derives)]
    interface IGovernor {
        event ProposalCreated(uint256 indexed proposalId, address indexed proposer, uint64 startTime, uint64 endTime);
        event VoteCast(uint256 indexed proposalId, address indexed voter, uint8 support, uint256 weight);
        event DelegatedVoteCast(uint256 indexed proposalId, address indexed delegate, uint8 support, uint256 amount, bytes32 allocationsHash);
        event ProposalExecuted(uint256 indexed proposalId);
        event ProposalCancelled(uint256 indexed proposalId);

        function getProposal(uint256 proposalId) external view returns (ProposalView memory);
    }

    #[sol(all_derives)]
    interface IDisputeResolver {
        event DisputeOpened(uint256 indexed disputeId, uint256 indexed taskId, address indexed initiator, string reason);
        event DisputeVoted(uint256 indexed disputeId, address indexed juror, bool supportsInitiator, uint256 weight);
        event DisputeResolved(uint256 indexed disputeId, bool initiatorWon);
    }

    #[sol(all_derives)]
    interface IVotePower {
        event Staked(address indexed user, uint256 amount);
        event Unstaked(address indexed user, uint256 amount);
        event ReputationUpdated(address indexed user, uint256 newScore);

        function votingPower(address user) external view returns (uint256);
        function getDelegators(address delegate) external view returns (address[] memory);
        function delegatedPower(address delegator) external view returns (uint256);
        function totalDelegatedPower(address delegate) external view returns (uint256);
        function proposalPowerUsed(uint256 proposalId, address delegate) external view returns (uint256);
        function delegatorPowerUsed(uint256 proposalId, address delegator) external view returns (uint256);
    }

    #[sol(all_derives)]
    interface ITreasury {
        event Deposited(address indexed account, uint256 assets, uint256 shares);
        event RedemptionRequested(uint256 indexed requestId, address indexed account, uint256 shares);
        event RedemptionFulfilled(uint256 indexed requestId, uint256 assets);
        event RedemptionCancelled(uint256 indexed requestId);
    }
}

/// On-chain `TaskMarket` status codes.
pub fn task_status_name(code: u8) -> &'static str {
    match code {
        0 => "Open",
        1 => "Assigned",
        2 => "Submitted",
        3 => "Completed",
        4 => "Disputed",
        5 => "Cancelled",
        _ => "Unknown",
    }
}

/// On-chain `Governor` proposal states.
pub fn proposal_state_name(code: u8) -> &'static str {
    match code {
        0 => "Pending",
        1 => "Active",
        2 => "Defeated",
        3 => "Succeeded",
        4 => "Executed",
        5 => "Cancelled",
        _ => "Unknown",
    }
}
